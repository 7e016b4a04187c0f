//! x86_64 architecture glue: segmentation, interrupts, timer, context
//! switch and the SYSCALL entry.

pub mod context;
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
pub mod irq;
pub mod syscall;
pub mod timer;

/// Bring up the CPU tables and the interrupt plumbing, in dependency order.
#[cfg(target_os = "none")]
pub fn init() {
    gdt::init();
    idt::init();
    irq::init();
    syscall::init();
}
