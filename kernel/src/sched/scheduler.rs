//! The scheduler
//!
//! Priority scheduling with a 100 Hz preemption tick and cooperative
//! yields. One process is RUNNING at any time; switching away from a
//! RUNNING non-idle process re-enqueues it at the back of its priority
//! class. A zombie left behind by `exit` is parked in the one-slot reap
//! area and destroyed by the incoming process immediately after the
//! context switch.

use alloc::boxed::Box;

use spin::Mutex;

use super::queue::ReadyQueue;
use crate::arch::x86_64::syscall::set_kernel_stack;
use crate::error::KernelError;
use crate::process::{self, table, ProcPtr, ProcessState};

/// Ticks a process may run before the scheduler looks for a replacement.
pub const TICKS_PER_SLICE: u64 = 10;

struct Scheduler {
    ready: ReadyQueue,
    current: Option<ProcPtr>,
    /// Exactly one pending zombie, set by `exit_current`, drained by the
    /// incoming process right after the switch.
    reap_slot: Option<ProcPtr>,
    enabled: bool,
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler {
    ready: ReadyQueue::new(),
    current: None,
    reap_slot: None,
    enabled: false,
});

/// Arm the scheduler. Before this, ticks and yields are no-ops.
pub fn init() {
    crate::arch::without_interrupts(|| {
        SCHEDULER.lock().enabled = true;
    });
    log::info!("scheduler initialized");
}

pub fn set_current(proc: ProcPtr) {
    crate::arch::without_interrupts(|| {
        SCHEDULER.lock().current = Some(proc);
    });
}

pub fn current() -> Option<ProcPtr> {
    crate::arch::without_interrupts(|| SCHEDULER.lock().current)
}

/// Put a READY process into the run queue.
pub fn enqueue(proc: ProcPtr) {
    crate::arch::without_interrupts(|| {
        SCHEDULER.lock().ready.insert(proc);
    });
}

/// Charge one tick to the running process; true when its slice is used up.
///
/// Called from the timer interrupt with interrupts off. The caller decides
/// whether to actually reschedule (it must not when the interrupted frame
/// had interrupts masked).
pub fn note_tick() -> bool {
    crate::arch::without_interrupts(|| {
        let s = SCHEDULER.lock();
        if !s.enabled {
            return false;
        }
        let Some(cur) = s.current else {
            return false;
        };
        // SAFETY: The current process is live; interrupts are off.
        unsafe {
            let c = cur.as_mut();
            c.total_ticks += 1;
            c.total_ticks % TICKS_PER_SLICE == 0
        }
    })
}

/// Pick the next process and update queue/state bookkeeping.
///
/// Runs under the scheduler lock with interrupts off. Returns the pair to
/// switch between, or `None` when the current process should keep running.
fn pick_next() -> Option<(ProcPtr, ProcPtr)> {
    let mut s = SCHEDULER.lock();
    if !s.enabled {
        return None;
    }
    let old = s.current?;
    let new = match s.ready.peek_front() {
        Some(n) => n,
        None => table::idle()?,
    };
    if new == old {
        return None;
    }

    s.ready.remove(new);

    // SAFETY: Both processes are live; the lock plus masked interrupts give
    // exclusive access to their state.
    unsafe {
        let o = old.as_mut();
        if o.state == ProcessState::Running && o.pid != 0 {
            o.state = ProcessState::Ready;
            s.ready.insert(old);
        }
        let n = new.as_mut();
        n.state = ProcessState::Running;
        log::trace!("switching {} -> {}", o.pid, n.pid);
    }

    s.current = Some(new);
    // SAFETY: `new` is live.
    set_kernel_stack(unsafe { new.as_ref().stack_top() });

    Some((old, new))
}

/// Yield the CPU to the best runnable process.
///
/// Interrupts are unconditionally re-enabled once the switch returns (or
/// immediately, when there was nothing to switch to).
pub fn schedule() {
    crate::arch::disable_interrupts();

    if let Some((old, new)) = pick_next() {
        // SAFETY: Interrupts are off; both processes are live. Execution
        // continues in `new`; the reap drain below runs in its context.
        unsafe { process::switch_contexts(old, new) };
        reap_pending();
    }

    crate::arch::enable_interrupts();
}

/// Destroy the zombie parked in the reap slot, if any.
///
/// Runs in the context of the process that just received the CPU.
fn reap_pending() {
    let dead = crate::arch::without_interrupts(|| SCHEDULER.lock().reap_slot.take());
    let Some(dead) = dead else { return };

    // SAFETY: The zombie is no longer current and not queued; nothing else
    // references it once the slot is drained.
    let pid = unsafe { dead.as_ref().pid };
    if pid == 0 {
        return;
    }
    log::debug!("reaping process PID {}", pid);
    table::take(pid);
    // SAFETY: Created by Box::leak in process creation; the last reference
    // was removed from the table above. Dropping frees the kernel stack and
    // the argv copies.
    unsafe { drop(Box::from_raw(dead.as_ptr())) };
}

/// Terminate the calling process; never returns.
pub fn exit_current(code: i32) -> ! {
    crate::arch::disable_interrupts();

    let switch = {
        let mut s = SCHEDULER.lock();
        let Some(cur) = s.current else {
            log::error!("exit with no current process");
            drop(s);
            loop {
                crate::arch::halt();
            }
        };
        // SAFETY: `cur` is live; lock held, interrupts off.
        unsafe {
            let c = cur.as_mut();
            c.state = ProcessState::Zombie;
            c.exit_code = code;
            log::info!("process {} exited with code {}", c.pid, code);
        }
        s.reap_slot = Some(cur);

        let target = match s.ready.pop_front() {
            Some(t) => t,
            None => match table::idle() {
                Some(i) => i,
                None => {
                    log::error!("exit: no runnable target and no idle process");
                    drop(s);
                    loop {
                        crate::arch::halt();
                    }
                }
            },
        };
        // SAFETY: `target` is live.
        unsafe { target.as_mut().state = ProcessState::Running };
        s.current = Some(target);
        // SAFETY: `target` is live.
        set_kernel_stack(unsafe { target.as_ref().stack_top() });
        (cur, target)
    };

    // SAFETY: Interrupts off; both sides live. The zombie's context is
    // saved but never resumed.
    unsafe { process::switch_contexts(switch.0, switch.1) };

    // A zombie is never scheduled again.
    loop {
        crate::arch::halt();
    }
}

/// Terminate another process and free its resources immediately.
pub fn kill(pid: u32) -> Result<(), KernelError> {
    if pid == 0 {
        return Err(KernelError::InvalidArgument { name: "pid" });
    }
    if process::current_pid() == pid {
        // The running process must exit through exit_current so its stack
        // is not freed underneath it.
        return Err(KernelError::InvalidState { expected: "non-current process" });
    }

    let target = table::get(pid).ok_or(KernelError::NotFound { resource: "process", id: pid as u64 })?;

    let freeable = crate::arch::without_interrupts(|| {
        let mut s = SCHEDULER.lock();
        // SAFETY: Table entry implies liveness; lock held.
        unsafe {
            let t = target.as_mut();
            if t.state == ProcessState::Zombie || t.state == ProcessState::Terminated {
                return false;
            }
            t.state = ProcessState::Terminated;
        }
        s.ready.remove(target);
        true
    });

    if !freeable {
        return Err(KernelError::InvalidState { expected: "live process" });
    }

    table::take(pid);
    // SAFETY: Removed from table and queue; never current (checked above).
    unsafe { drop(Box::from_raw(target.as_ptr())) };
    log::info!("killed process PID {}", pid);
    Ok(())
}

/// Move the calling process to SLEEPING for at least `ms` milliseconds.
pub fn sleep_current(ms: u64) {
    let did_sleep = crate::arch::without_interrupts(|| {
        let mut s = SCHEDULER.lock();
        let Some(cur) = s.current else { return false };
        // SAFETY: Current is live; lock held.
        unsafe {
            let c = cur.as_mut();
            c.state = ProcessState::Sleeping;
            c.sleep_ms = ms.max(1);
        }
        s.ready.remove(cur);
        true
    });
    if did_sleep {
        schedule();
    }
}

/// Move a SLEEPING process back to READY.
pub fn wake(pid: u32) {
    let Some(target) = table::get(pid) else { return };
    crate::arch::without_interrupts(|| {
        let mut s = SCHEDULER.lock();
        // SAFETY: Table entry implies liveness; lock held.
        unsafe {
            let t = target.as_mut();
            if t.state != ProcessState::Sleeping {
                return;
            }
            t.state = ProcessState::Ready;
            t.sleep_ms = 0;
        }
        s.ready.insert(target);
    });
}

/// Advance sleep timers by one tick and wake expired sleepers.
///
/// Called from the timer interrupt with interrupts off.
pub fn tick_sleepers() {
    let mut woken: [Option<ProcPtr>; crate::process::MAX_PROCESSES] =
        [None; crate::process::MAX_PROCESSES];
    let mut n = 0;

    table::for_each(|p| {
        // SAFETY: Table entries are live; interrupts are off.
        unsafe {
            let r = p.as_mut();
            if r.state == ProcessState::Sleeping {
                r.sleep_ms = r.sleep_ms.saturating_sub(crate::arch::x86_64::timer::MS_PER_TICK);
                if r.sleep_ms == 0 {
                    r.state = ProcessState::Ready;
                    if n < woken.len() {
                        woken[n] = Some(p);
                        n += 1;
                    }
                }
            }
        }
    });

    if n > 0 {
        let mut s = SCHEDULER.lock();
        for w in woken.iter().take(n).flatten() {
            s.ready.insert(*w);
        }
    }
}

/// Number of processes waiting in the ready queue (diagnostics).
pub fn ready_count() -> usize {
    crate::arch::without_interrupts(|| SCHEDULER.lock().ready.len())
}
