//! Process table and PID allocation
//!
//! PIDs index directly into a fixed table. PID 0 is the idle process; user
//! PIDs count up from 1 and are not recycled (the table is full when the
//! counter reaches the capacity, as in the original design).

use spin::Mutex;

use super::{ProcPtr, MAX_PROCESSES};
use crate::error::KernelError;

struct ProcessTable {
    slots: [Option<ProcPtr>; MAX_PROCESSES],
    next_pid: u32,
}

static TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable {
    slots: [None; MAX_PROCESSES],
    next_pid: 1,
});

/// Clear the table (boot only).
pub fn reset() {
    let mut t = TABLE.lock();
    t.slots = [None; MAX_PROCESSES];
    t.next_pid = 1;
}

/// Reserve the next PID.
pub fn alloc_pid() -> Result<u32, KernelError> {
    crate::arch::without_interrupts(|| {
        let mut t = TABLE.lock();
        let pid = t.next_pid;
        if pid as usize >= MAX_PROCESSES {
            log::error!("process table full");
            return Err(KernelError::ResourceExhausted { resource: "process table" });
        }
        t.next_pid += 1;
        Ok(pid)
    })
}

pub fn install(pid: u32, ptr: ProcPtr) {
    crate::arch::without_interrupts(|| {
        TABLE.lock().slots[pid as usize] = Some(ptr);
    });
}

/// Remove and return the table entry for `pid`.
pub fn take(pid: u32) -> Option<ProcPtr> {
    crate::arch::without_interrupts(|| {
        if pid as usize >= MAX_PROCESSES {
            return None;
        }
        TABLE.lock().slots[pid as usize].take()
    })
}

pub fn get(pid: u32) -> Option<ProcPtr> {
    crate::arch::without_interrupts(|| {
        if pid as usize >= MAX_PROCESSES {
            return None;
        }
        TABLE.lock().slots[pid as usize]
    })
}

/// The idle process; present from `process::init` until shutdown.
pub fn idle() -> Option<ProcPtr> {
    get(0)
}

/// Run `f` over every live process (scheduler tick bookkeeping).
pub fn for_each(mut f: impl FnMut(ProcPtr)) {
    crate::arch::without_interrupts(|| {
        let t = TABLE.lock();
        for slot in t.slots.iter().flatten() {
            f(*slot);
        }
    });
}

/// Number of live table entries.
pub fn count() -> usize {
    crate::arch::without_interrupts(|| TABLE.lock().slots.iter().flatten().count())
}
