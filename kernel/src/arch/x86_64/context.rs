//! x86_64 context switching

use core::arch::naked_asm;

/// Saved register file of a kernel-mode process.
///
/// Field order is load-bearing: the offsets are hard-coded in
/// [`context_switch`] below.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CpuContext {
    /// General purpose registers
    pub r15: u64, // 0x00
    pub r14: u64, // 0x08
    pub r13: u64, // 0x10
    pub r12: u64, // 0x18
    pub r11: u64, // 0x20
    pub r10: u64, // 0x28
    pub r9: u64,  // 0x30
    pub r8: u64,  // 0x38
    pub rdi: u64, // 0x40
    pub rsi: u64, // 0x48
    pub rbp: u64, // 0x50
    pub rbx: u64, // 0x58
    pub rdx: u64, // 0x60
    pub rcx: u64, // 0x68
    pub rax: u64, // 0x70

    /// Stack pointer as it will be after the switch returns
    pub rsp: u64, // 0x78

    /// Resume address
    pub rip: u64, // 0x80

    /// CPU flags
    pub rflags: u64, // 0x88

    /// Page table base
    pub cr3: u64, // 0x90
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rsp: 0,
            rip: 0,
            rflags: 0x202,
            cr3: 0,
        }
    }
}

// SAFETY: CpuContext is plain register state; it is only ever touched by the
// owning process and the scheduler with interrupts disabled.
unsafe impl Send for CpuContext {}
unsafe impl Sync for CpuContext {}

/// Save the caller's register file into `current` and resume `next`.
///
/// The saved `rsp` is the value the stack pointer will have once this call
/// returns, and `rip` is the return address, so a later switch back resumes
/// the caller as if `context_switch` had returned normally. CR3 is only
/// rewritten when it differs.
///
/// # Safety
///
/// Must be called with interrupts disabled. `current` must be writable and
/// `next` must hold a register file whose `rip`/`rsp`/`cr3` are valid to
/// resume.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(current: *mut CpuContext, next: *const CpuContext) {
    naked_asm!(
        // Save general purpose registers into [rdi].
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rdi",
        "mov [rdi + 0x48], rsi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rbx",
        "mov [rdi + 0x60], rdx",
        "mov [rdi + 0x68], rcx",
        "mov [rdi + 0x70], rax",
        // Post-return stack pointer and the return address as resume RIP.
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x78], rax",
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        // Flags and page-table base.
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "mov rax, cr3",
        "mov [rdi + 0x90], rax",
        // Switch CR3 only if the address space differs.
        "mov rax, [rsi + 0x90]",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        // Restore the incoming register file; rsi and rax last.
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r11, [rsi + 0x20]",
        "mov r10, [rsi + 0x28]",
        "mov r9,  [rsi + 0x30]",
        "mov r8,  [rsi + 0x38]",
        "mov rdi, [rsi + 0x40]",
        "mov rbp, [rsi + 0x50]",
        "mov rbx, [rsi + 0x58]",
        "mov rdx, [rsi + 0x60]",
        "mov rcx, [rsi + 0x68]",
        // Land on the incoming stack, stage RIP and RFLAGS on it.
        "mov rsp, [rsi + 0x78]",
        "push qword ptr [rsi + 0x80]",
        "push qword ptr [rsi + 0x88]",
        "mov rax, [rsi + 0x70]",
        "mov rsi, [rsi + 0x48]",
        "popfq",
        "ret",
    );
}

/// First-run shim for processes created with arguments.
///
/// The creator seeds argc in r12, argv in r13 and the real entry point in
/// r14; this moves them into the SysV argument registers and jumps. When
/// the entry function returns, the trampoline slot the creator placed on
/// the stack terminates the process.
///
/// # Safety
///
/// Only reachable as the initial RIP of a context whose r12/r13/r14 were
/// seeded by process creation.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn process_entry_thunk() {
    naked_asm!("mov rdi, r12", "mov rsi, r13", "jmp r14",);
}
