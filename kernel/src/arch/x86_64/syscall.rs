//! x86_64 SYSCALL/SYSRET entry
//!
//! `syscall` from ring 3 lands in [`syscall_entry`] with interrupts masked
//! (FMASK clears IF and TF). The entry switches to the current process's
//! kernel stack, saves the user return state and the callee-saved
//! registers, shuffles the argument registers into the SysV C ABI and calls
//! the dispatcher. The return value comes back in rax through `sysretq`.

use core::arch::naked_asm;

use super::gdt;

/// Kernel stack top for the running process; rewritten on every context
/// switch together with TSS.RSP0.
#[no_mangle]
static mut SYSCALL_RSP0: u64 = 0;

/// Scratch slot for the user stack pointer across the entry.
///
/// A single slot is enough: FMASK keeps interrupts off until the kernel
/// stack is live, the kernel never issues `syscall` itself, and there is
/// one CPU.
#[no_mangle]
static mut SYSCALL_USER_RSP: u64 = 0;

/// SYSCALL instruction target.
///
/// ABI: number in rax, arguments 1..4 in rdi, rsi, rdx, r10; result in rax.
///
/// # Safety
///
/// Entered only by the CPU's SYSCALL instruction; expects the register
/// state that instruction establishes (user RIP in rcx, RFLAGS in r11).
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        // Stash the user stack and adopt the per-process kernel stack.
        "mov [rip + {user_rsp}], rsp",
        "mov rsp, [rip + {rsp0}]",
        "push qword ptr [rip + {user_rsp}]",
        // User return state.
        "push rcx", // user RIP
        "push r11", // user RFLAGS
        // Callee-saved registers.
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // SYSCALL ABI -> SysV C ABI: handler(number, a1, a2, a3, a4).
        "mov r8, r10",
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "sub rsp, 8", // 16-byte alignment for the call
        "call {handler}",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "pop r11", // user RFLAGS
        "pop rcx", // user RIP
        "pop rsp", // user stack
        "sysretq",
        user_rsp = sym SYSCALL_USER_RSP,
        rsp0 = sym SYSCALL_RSP0,
        handler = sym crate::syscall::syscall_handler,
    );
}

/// Publish the kernel stack of the process about to run.
///
/// Kept in both the entry's RIP-relative slot (SYSCALL path) and TSS.RSP0
/// (interrupt path). Called from the scheduler with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: Single write, scheduler context only, interrupts disabled.
    unsafe {
        core::ptr::write_volatile(&raw mut SYSCALL_RSP0, stack_top);
    }
    gdt::set_kernel_stack(stack_top);
}

/// Enable SYSCALL/SYSRET and program the entry MSRs.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;
    use x86_64::VirtAddr;

    let sel = gdt::selectors();

    // SAFETY: Standard SYSCALL MSR setup; the selectors satisfy the
    // layout STAR derives SYSRET selectors from (see gdt.rs).
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        Star::write(
            sel.user_code_selector,
            sel.user_data_selector,
            sel.code_selector,
            sel.data_selector,
        )
        .unwrap();
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        // Clear IF and TF on entry; the kernel re-enables interrupts when
        // it is ready.
        SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG);
    }

    log::info!("SYSCALL/SYSRET initialized");
}
