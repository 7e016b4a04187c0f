//! Programmable interval timer (PIT) driving the scheduler
//!
//! Channel 0 runs in rate-generator mode at 100 Hz. Each tick bumps the
//! global counter, advances sleeping processes and the HID bring-up state
//! machines, and -- only when the interrupted frame had interrupts enabled
//! -- invokes the scheduler tick.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const PIT_FREQUENCY_HZ: u32 = 1_193_182;

/// Scheduler tick rate.
pub const TICK_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks that arrive while one is still being processed are dropped.
static IN_TICK: AtomicBool = AtomicBool::new(false);

/// Milliseconds per tick at [`TICK_HZ`].
pub const MS_PER_TICK: u64 = 1000 / TICK_HZ as u64;

/// Program PIT channel 0 for periodic interrupts at `frequency` Hz.
#[cfg(target_os = "none")]
pub fn init(frequency: u32) {
    use x86_64::instructions::port::Port;

    let divisor = PIT_FREQUENCY_HZ / frequency;

    // SAFETY: Standard PIT programming sequence on ports 0x43/0x40.
    unsafe {
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut data: Port<u8> = Port::new(0x40);
        cmd.write(0x36); // channel 0, lo/hi byte, rate generator, binary
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    log::info!("PIT programmed for {} Hz", frequency);
}

#[cfg(not(target_os = "none"))]
pub fn init(_frequency: u32) {}

/// Ticks since boot.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    get_ticks() * MS_PER_TICK
}

/// The IRQ0 body: bookkeeping only, no rescheduling.
///
/// `if_was_set` reflects the interrupted frame's IF bit; preemption is
/// suppressed when the tick landed in a critical section. Returns whether
/// the caller should invoke the scheduler -- the trap handler does that
/// only after acknowledging the interrupt, so a context switch cannot hold
/// the PIC's in-service bit hostage.
pub fn handle_tick(if_was_set: bool) -> bool {
    if IN_TICK.swap(true, Ordering::SeqCst) {
        // A tick arrived while one was still running; drop it.
        return false;
    }

    TICKS.fetch_add(1, Ordering::Relaxed);

    crate::sched::tick_sleepers();
    crate::drivers::usb::hid::init_tick();

    let preempt = if_was_set && crate::sched::note_tick();

    IN_TICK.store(false, Ordering::SeqCst);
    preempt
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tick_counter_advances_and_masked_frames_never_preempt() {
        let before = get_ticks();
        assert!(!handle_tick(false));
        assert_eq!(get_ticks(), before + 1);
    }

    #[test]
    fn ms_per_tick_matches_100hz() {
        assert_eq!(MS_PER_TICK, 10);
    }
}
