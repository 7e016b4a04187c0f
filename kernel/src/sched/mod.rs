//! Scheduling

mod queue;
mod scheduler;

pub use queue::ReadyQueue;
pub use scheduler::{
    current, enqueue, exit_current, init, kill, note_tick, ready_count, schedule, set_current,
    sleep_current, tick_sleepers, wake, TICKS_PER_SLICE,
};
