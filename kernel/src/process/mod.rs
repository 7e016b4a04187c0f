//! Process model
//!
//! Kernel-mode processes with a saved register file, an owned kernel stack
//! and deep-copied arguments. Exactly one process is RUNNING at any time;
//! the idle process (PID 0) exists from init and is never enqueued. A
//! process that returns from its entry function falls into the exit
//! trampoline planted in its top stack slot.

pub mod argv;
pub mod table;

use alloc::boxed::Box;
use alloc::string::String;
use core::ptr::NonNull;

use crate::arch::x86_64::context::{context_switch, process_entry_thunk, CpuContext};
use crate::error::KernelError;

pub use argv::Argv;

/// Process table capacity; PIDs are indices into it.
pub const MAX_PROCESSES: usize = 64;

/// Kernel stack size per process.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Priority of the idle process (lowest).
pub const IDLE_PRIORITY: u8 = 255;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Sleeping,
    Zombie,
    Terminated,
}

/// A kernel process.
pub struct Process {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub state: ProcessState,
    /// Lower value = higher priority.
    pub priority: u8,
    pub uid: u32,
    pub gid: u32,
    /// Owned kernel stack; the context's rsp points into it.
    pub kernel_stack: Box<[u8]>,
    pub context: CpuContext,
    /// Top-level page table (CR3 value) this process runs under.
    pub pml4_phys: u64,
    /// Deep-copied arguments, freed when the process is reaped.
    pub args: Option<Argv>,
    pub exit_code: i32,
    /// Remaining sleep time in milliseconds while SLEEPING.
    pub sleep_ms: u64,
    /// Timer ticks charged to this process.
    pub total_ticks: u64,
}

impl Process {
    /// Aligned top-of-stack for a fresh process (16-byte, SysV).
    pub fn stack_top(&self) -> u64 {
        let base = self.kernel_stack.as_ptr() as u64;
        (base + self.kernel_stack.len() as u64 - 16) & !0xF
    }
}

/// Shared pointer to a live process.
///
/// Processes are boxed at creation and leaked into the table; the pointer
/// stays valid until reaping converts it back into a `Box`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcPtr(NonNull<Process>);

// SAFETY: Single CPU; all mutation happens with interrupts disabled through
// the scheduler and table locks.
unsafe impl Send for ProcPtr {}

impl ProcPtr {
    pub fn new(ptr: NonNull<Process>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> *mut Process {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The process must not have been reaped.
    pub unsafe fn as_ref<'a>(&self) -> &'a Process {
        // SAFETY: Caller guarantees liveness.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// The process must not have been reaped and the caller must hold the
    /// scheduling lock (or run with interrupts disabled on the only CPU).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut Process {
        // SAFETY: Caller guarantees exclusive access.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// Entry-point type for kernel processes.
pub type ProcessEntry = extern "C" fn();

/// Terminates a process that returned from its entry function.
///
/// The creator plants this function's address in the initial top stack
/// slot, so a plain `ret` from the entry lands here.
pub extern "C" fn process_return_trampoline() -> ! {
    exit(0);
}

/// Create the idle process (PID 0) and make it the current process.
///
/// The caller's own execution context becomes the idle process: the first
/// `schedule()` saves the boot flow into this object, and the boot flow's
/// closing `loop { schedule(); hlt }` is the idle loop.
pub fn init() {
    log::info!("initializing process manager");
    table::reset();

    let idle = Box::new(Process {
        pid: 0,
        parent_pid: 0,
        name: String::from("idle"),
        state: ProcessState::Running,
        priority: IDLE_PRIORITY,
        uid: 0,
        gid: 0,
        kernel_stack: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        context: CpuContext::zeroed(),
        pml4_phys: crate::arch::read_cr3(),
        args: None,
        exit_code: 0,
        sleep_ms: 0,
        total_ticks: 0,
    });

    let ptr = ProcPtr::new(NonNull::from(Box::leak(idle)));
    table::install(0, ptr);
    crate::sched::set_current(ptr);

    log::info!("process manager initialized");
}

/// Create a process without arguments.
pub fn create(name: &str, entry: ProcessEntry, priority: u8) -> Result<u32, KernelError> {
    create_with_args(name, entry, priority, &[])
}

/// Create a process, deep-copying `args` into process-owned memory.
///
/// The initial stack layout puts the exit trampoline in the top slot; the
/// register snapshot seeds rip with the entry (or the argument thunk),
/// argc in r12 and the argv table in r13.
pub fn create_with_args(
    name: &str,
    entry: ProcessEntry,
    priority: u8,
    args: &[&str],
) -> Result<u32, KernelError> {
    create_at(name, entry as usize as u64, priority, args, None)
}

/// Create a process from a raw entry address (ELF images), optionally
/// running under its own top-level page table.
pub fn create_at(
    name: &str,
    entry: u64,
    priority: u8,
    args: &[&str],
    pml4: Option<crate::mm::PhysicalAddress>,
) -> Result<u32, KernelError> {
    let pid = table::alloc_pid()?;

    let (parent_pid, uid, gid) = match crate::sched::current() {
        Some(cur) => {
            // SAFETY: The current process is live by definition.
            let c = unsafe { cur.as_ref() };
            (c.pid, c.uid, c.gid)
        }
        None => (0, 0, 0),
    };

    let argv = if args.is_empty() {
        None
    } else {
        let copied = Argv::copy_from(args).ok_or(KernelError::OutOfMemory)?;
        log::debug!("copied {} arguments for {}", copied.argc(), name);
        Some(copied)
    };

    let mut proc = Box::new(Process {
        pid,
        parent_pid,
        name: String::from(name),
        state: ProcessState::Ready,
        priority,
        uid,
        gid,
        kernel_stack: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        context: CpuContext::zeroed(),
        pml4_phys: pml4.map(|p| p.as_u64()).unwrap_or_else(crate::arch::read_cr3),
        args: argv,
        exit_code: 0,
        sleep_ms: 0,
        total_ticks: 0,
    });

    // Plant the exit trampoline so a clean `ret` from the entry function
    // terminates the process with code 0.
    let top = proc.stack_top();
    let initial_rsp = top - 8;
    // SAFETY: initial_rsp points into the owned, zeroed kernel stack.
    unsafe {
        *(initial_rsp as *mut u64) = process_return_trampoline as usize as u64;
    }

    proc.context.rsp = initial_rsp;
    proc.context.rbp = initial_rsp;
    proc.context.rflags = 0x202;
    proc.context.cr3 = proc.pml4_phys;

    match &proc.args {
        Some(argv) => {
            // First run goes through the thunk, which moves r12/r13 into
            // the SysV argument registers and jumps to r14.
            proc.context.r12 = argv.argc() as u64;
            proc.context.r13 = argv.as_raw() as u64;
            proc.context.r14 = entry;
            proc.context.rip = process_entry_thunk as usize as u64;
        }
        None => {
            proc.context.rip = entry;
        }
    }

    let ptr = ProcPtr::new(NonNull::from(Box::leak(proc)));
    table::install(pid, ptr);
    crate::sched::enqueue(ptr);

    log::info!("created process {} (PID {})", name, pid);
    Ok(pid)
}

/// Terminate the calling process and switch away; never returns.
///
/// The process becomes a ZOMBIE parked in the one-slot reap area; the next
/// process to run frees its stack, argv and process object right after the
/// context switch.
pub fn exit(code: i32) -> ! {
    crate::sched::exit_current(code)
}

/// Terminate another process immediately and free its resources.
///
/// The calling process must not name itself; use [`exit`] for that.
pub fn kill(pid: u32) -> Result<(), KernelError> {
    crate::sched::kill(pid)
}

/// Cooperative yield.
pub fn yield_now() {
    crate::sched::schedule();
}

/// Sleep the calling process for at least `ms` milliseconds.
pub fn sleep(ms: u64) {
    crate::sched::sleep_current(ms);
}

/// Move a sleeping process back to READY.
pub fn wake(pid: u32) {
    crate::sched::wake(pid);
}

pub fn current() -> Option<ProcPtr> {
    crate::sched::current()
}

pub fn current_pid() -> u32 {
    match crate::sched::current() {
        // SAFETY: The current process is live.
        Some(p) => unsafe { p.as_ref().pid },
        None => 0,
    }
}

/// Name of the current process for fault reports; avoids allocation.
pub fn current_name_for_fault() -> Option<&'static str> {
    let cur = crate::sched::current()?;
    // SAFETY: The current process is live; the name borrow is consumed by
    // the fault path immediately, before any reaping can run.
    unsafe {
        let p = cur.as_ref();
        Some(core::mem::transmute::<&str, &'static str>(p.name.as_str()))
    }
}

/// Perform the low-level switch between two process contexts.
///
/// # Safety
///
/// Interrupts must be disabled; both processes must be live.
pub(crate) unsafe fn switch_contexts(old: ProcPtr, new: ProcPtr) {
    // SAFETY: Caller guarantees liveness and masked interrupts.
    unsafe {
        context_switch(&mut old.as_mut().context, &new.as_ref().context);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn dummy_process(pid: u32, priority: u8) -> Box<Process> {
        Box::new(Process {
            pid,
            parent_pid: 0,
            name: String::from("test"),
            state: ProcessState::Ready,
            priority,
            uid: 0,
            gid: 0,
            kernel_stack: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
            context: CpuContext::zeroed(),
            pml4_phys: 0,
            args: None,
            exit_code: 0,
            sleep_ms: 0,
            total_ticks: 0,
        })
    }

    #[test]
    fn stack_top_is_16_byte_aligned() {
        let p = dummy_process(1, 10);
        assert_eq!(p.stack_top() % 16, 0);
        let base = p.kernel_stack.as_ptr() as u64;
        assert!(p.stack_top() <= base + KERNEL_STACK_SIZE as u64);
        assert!(p.stack_top() >= base + KERNEL_STACK_SIZE as u64 - 32);
    }

    #[test]
    fn trampoline_slot_sits_below_stack_top() {
        let p = dummy_process(2, 10);
        let initial_rsp = p.stack_top() - 8;
        assert!(initial_rsp > p.kernel_stack.as_ptr() as u64);
        assert_eq!(initial_rsp % 8, 0);
    }
}
