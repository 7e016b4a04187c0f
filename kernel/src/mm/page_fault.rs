//! Page-fault handling
//!
//! Two classes of fault reach the kernel: non-present accesses inside the
//! kernel-heap window, which are resolved by installing a fresh zeroed
//! frame (the heap hands out virtual ranges before touching them), and
//! everything else, which is fatal. The architecture trap handler decodes
//! CR2 and the error code into a [`FaultDecision`] and delegates here.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{kheap, paging, phys, VirtualAddress, PAGE_SIZE};
use crate::error::KernelError;

/// Error-code bit 0: 0 = not present, 1 = protection violation.
const ERR_PRESENT: u64 = 1 << 0;
/// Error-code bit 1: write access.
const ERR_WRITE: u64 = 1 << 1;
/// Error-code bit 2: user-mode access.
const ERR_USER: u64 = 1 << 2;
/// Error-code bit 4: instruction fetch.
const ERR_FETCH: u64 = 1 << 4;

/// What the trap handler should do about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Non-present fault inside the heap window: install a page and resume.
    DemandFillHeap { page: u64 },
    /// Anything else: dump state and panic.
    Fatal,
}

/// Set while a page fault is being handled; a nested fault aborts.
static IN_PAGE_FAULT: AtomicBool = AtomicBool::new(false);

/// Classify a fault from CR2 and the raw error code.
pub fn classify(cr2: u64, error_code: u64) -> FaultDecision {
    let not_present = error_code & ERR_PRESENT == 0;
    let in_heap = (kheap::KHEAP_START..kheap::KHEAP_END).contains(&cr2);

    if not_present && in_heap {
        FaultDecision::DemandFillHeap { page: cr2 & !(PAGE_SIZE as u64 - 1) }
    } else {
        FaultDecision::Fatal
    }
}

/// Mark entry into the fault path. Returns false on a nested fault.
pub fn enter() -> bool {
    !IN_PAGE_FAULT.swap(true, Ordering::SeqCst)
}

pub fn leave() {
    IN_PAGE_FAULT.store(false, Ordering::SeqCst);
}

/// Back-install a zeroed, present+writable page for a heap-window fault.
///
/// The parent levels (PML4/PDPT/PD) must already exist -- the heap's bump
/// cursor only ever crosses into ranges whose tables were materialized by
/// earlier mappings or at paging init. A missing parent means the address
/// was never reserved by the heap and the fault is fatal.
pub fn demand_fill_heap(page: u64) -> Result<(), KernelError> {
    let frame = phys::alloc_frame().map_err(|_| KernelError::OutOfMemory)?;

    // Zero through the identity/direct mapping before the PTE exists.
    // SAFETY: The frame was just allocated and is reachable through the
    // phys->virt convention used for page tables.
    unsafe {
        core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, PAGE_SIZE);
    }

    match paging::install_heap_pte(VirtualAddress::new(page), frame) {
        Ok(()) => {
            log::trace!("demand-filled heap page {:#x} -> {:#x}", page, frame.as_u64());
            Ok(())
        }
        Err(e) => {
            phys::free_frame(frame);
            Err(e)
        }
    }
}

/// Log everything useful about a fatal fault, then let the caller panic.
pub fn report_fatal(cr2: u64, error_code: u64, rip: u64) {
    log::error!("PAGE FAULT at {:#x} (rip {:#x})", cr2, rip);
    log::error!(
        "  {} | {} | {}{}",
        if error_code & ERR_PRESENT != 0 { "protection" } else { "not-present" },
        if error_code & ERR_WRITE != 0 { "write" } else { "read" },
        if error_code & ERR_USER != 0 { "user" } else { "kernel" },
        if error_code & ERR_FETCH != 0 { " | fetch" } else { "" },
    );
    paging::dump_walk(cr2);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn non_present_heap_fault_demand_fills() {
        let addr = kheap::KHEAP_START + 0x1234;
        // Error code 0b010: not present, write.
        match classify(addr, ERR_WRITE) {
            FaultDecision::DemandFillHeap { page } => {
                assert_eq!(page, kheap::KHEAP_START + 0x1000);
            }
            FaultDecision::Fatal => panic!("heap fault must demand-fill"),
        }
    }

    #[test]
    fn protection_fault_in_heap_is_fatal() {
        let addr = kheap::KHEAP_START + 0x1000;
        assert_eq!(classify(addr, ERR_PRESENT | ERR_WRITE), FaultDecision::Fatal);
    }

    #[test]
    fn faults_outside_heap_are_fatal() {
        assert_eq!(classify(0x0, 0), FaultDecision::Fatal);
        assert_eq!(classify(0x40_0000, ERR_WRITE), FaultDecision::Fatal);
        assert_eq!(classify(kheap::KHEAP_END, 0), FaultDecision::Fatal);
    }

    #[test]
    fn last_heap_page_still_demand_fills() {
        let addr = kheap::KHEAP_END - 1;
        assert!(matches!(classify(addr, 0), FaultDecision::DemandFillHeap { .. }));
    }

    #[test]
    fn reentrancy_guard_trips_on_nested_entry() {
        assert!(enter());
        assert!(!enter());
        leave();
        assert!(enter());
        leave();
    }
}
