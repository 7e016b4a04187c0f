//! Memory management
//!
//! Four layers, bottom up: the physical frame bitmap ([`phys`]), the 4-level
//! page-table mapper ([`paging`]), the kernel heap ([`kheap`]) and the
//! DMA-safe contiguous allocator ([`dma`]). Page faults inside the heap
//! window are resolved lazily by [`page_fault`].

pub mod dma;
pub mod kheap;
pub mod page_fault;
pub mod paging;
pub mod phys;

use bitflags::bitflags;

/// Size of a physical frame / virtual page (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Round down to the containing frame.
    pub const fn frame_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }
}

/// A usable RAM region from the boot memory map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
}

bitflags! {
    /// Low 12 bits of a page-table entry (plus NX in bit 63).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Initialize the memory system from the boot memory map.
///
/// Order matters: the frame allocator must exist before paging can allocate
/// table pages, and both must exist before the first `kmalloc`.
pub fn init(total_mem: u64, regions: &[MemoryRegion]) {
    log::info!("initializing memory system, {} MiB total", total_mem / (1024 * 1024));

    // SAFETY: Called once at boot with the firmware memory map, while the
    // bootloader identity mapping is still active (required for bitmap
    // placement).
    unsafe {
        phys::FRAME_ALLOCATOR.lock().init(total_mem, regions);
    }
    paging::init();

    // Extend the bootloader's identity mapping over every tracked region
    // with 2 MiB pages, so page-table frames allocated from high RAM stay
    // reachable through the identity phys->virt convention.
    const HUGE: u64 = 2 * 1024 * 1024;
    for r in regions {
        let base = r.base & !(HUGE - 1);
        let end = (r.base + r.length + HUGE - 1) & !(HUGE - 1);
        if paging::map_2m_range(
            VirtualAddress::new(base),
            PhysicalAddress::new(base),
            end - base,
            PageFlags::PRESENT | PageFlags::WRITABLE,
        )
        .is_err()
        {
            log::warn!("identity mapping of region at {:#x} failed", r.base);
        }
    }

    log::info!("kernel heap available at {:#x}", kheap::KHEAP_START);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
    }

    #[test]
    fn address_rounding() {
        assert_eq!(PhysicalAddress::new(0x1234).frame_base().as_u64(), 0x1000);
        assert_eq!(VirtualAddress::new(0x1FFF).page_base().as_u64(), 0x1000);
    }
}
