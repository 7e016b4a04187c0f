//! Architecture support
//!
//! Only x86_64 is supported. The helpers here exist so that core code can
//! run unmodified in host unit tests: on `target_os = "none"` they touch
//! real CPU state, on the host they are no-ops.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Run `f` with interrupts disabled, restoring the previous state after.
#[cfg(target_os = "none")]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    ::x86_64::instructions::interrupts::without_interrupts(f)
}

/// Host shim: no interrupt state to manage.
#[cfg(not(target_os = "none"))]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Read the physical address of the active top-level page table.
#[cfg(target_os = "none")]
pub fn read_cr3() -> u64 {
    ::x86_64::registers::control::Cr3::read().0.start_address().as_u64()
}

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> u64 {
    0
}

/// Switch the active top-level page table.
#[cfg(target_os = "none")]
pub fn write_cr3(pml4_phys: u64) {
    use ::x86_64::registers::control::{Cr3, Cr3Flags};
    use ::x86_64::structures::paging::PhysFrame;
    use ::x86_64::PhysAddr;

    // SAFETY: The caller installs a top-level table whose kernel half covers
    // the currently executing code (it was copied from the active table).
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4_phys)),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(not(target_os = "none"))]
pub fn write_cr3(_pml4_phys: u64) {}

/// Invalidate the TLB entry for one page.
#[cfg(target_os = "none")]
pub fn invlpg(virt: u64) {
    ::x86_64::instructions::tlb::flush(::x86_64::VirtAddr::new(virt));
}

#[cfg(not(target_os = "none"))]
pub fn invlpg(_virt: u64) {}

/// Reload CR3, flushing all non-global TLB entries.
#[cfg(target_os = "none")]
pub fn flush_tlb_all() {
    write_cr3(read_cr3());
}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb_all() {}

/// Enable interrupts.
#[cfg(target_os = "none")]
pub fn enable_interrupts() {
    ::x86_64::instructions::interrupts::enable();
}

#[cfg(not(target_os = "none"))]
pub fn enable_interrupts() {}

/// Disable interrupts.
#[cfg(target_os = "none")]
pub fn disable_interrupts() {
    ::x86_64::instructions::interrupts::disable();
}

#[cfg(not(target_os = "none"))]
pub fn disable_interrupts() {}

/// Halt until the next interrupt.
#[cfg(target_os = "none")]
pub fn halt() {
    ::x86_64::instructions::hlt();
}

#[cfg(not(target_os = "none"))]
pub fn halt() {
    core::hint::spin_loop();
}
