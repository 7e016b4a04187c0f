//! ModuOS kernel library
//!
//! The execution and I/O core of a small 64-bit x86 kernel: physical and
//! virtual memory management with a demand-paged kernel heap, a
//! priority-scheduled process model with SYSCALL entry and ELF64 loading,
//! and a USB host-controller transfer engine (UHCI/OHCI/EHCI) with a HID
//! class driver.
//!
//! The crate builds two ways: `no_std` for the bare-metal image, where the
//! kernel heap (C3 in mm::kheap) is the global allocator, and as a plain
//! host library for unit tests, where the system allocator stands in so
//! `alloc` containers work under the standard test harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::kheap::KernelAllocator = mm::kheap::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;
#[macro_use]
pub mod serial;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod events;
pub mod klog;
pub mod mm;
pub mod multiboot;
pub mod process;
pub mod sched;
pub mod syscall;

// Re-exports used across module boundaries and by the boot binary.
pub use error::KernelError;
pub use mm::{MemoryRegion, PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Heap allocation error handler.
///
/// Panic is intentional: an allocation failure that reaches the `alloc`
/// machinery (rather than a null return from kmalloc) is unrecoverable in
/// a no_std kernel. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
