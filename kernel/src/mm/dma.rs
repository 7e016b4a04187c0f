//! DMA-safe contiguous buffers
//!
//! A DMA buffer is a physically contiguous frame run made visible through a
//! page-aligned kernel-heap allocation: the heap pages are re-pointed at
//! the contiguous range while the allocation header keeps its original
//! backing. On free the original backing is restored (it is recoverable as
//! `header.phys_base + page_index * 4096` because the heap backs every
//! allocation contiguously), so the allocation can be returned to the heap
//! without double-freeing any frame.

use super::{kheap, paging, phys, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// A physically contiguous, kernel-mapped, zeroed buffer.
#[derive(Debug)]
pub struct DmaBuffer {
    pub virt: *mut u8,
    pub phys: PhysicalAddress,
    pub size: usize,
}

// SAFETY: The raw pointer refers to kernel-heap pages owned by the buffer;
// the single-CPU kernel serializes access.
unsafe impl Send for DmaBuffer {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    InvalidArgument,
    /// No physically contiguous run of the required length.
    NoContiguousFrames,
    /// The kernel heap could not supply the virtual window.
    HeapExhausted,
    RemapFailed,
}

/// Allocate a zeroed DMA buffer of at least `size` bytes.
///
/// `align` is satisfied trivially for any power of two up to the page size
/// because the buffer starts on a page boundary.
pub fn dma_alloc(size: usize, align: usize) -> Result<DmaBuffer, DmaError> {
    if size == 0 || (align != 0 && !align.is_power_of_two()) || align > PAGE_SIZE {
        return Err(DmaError::InvalidArgument);
    }

    let pages = size.div_ceil(PAGE_SIZE);

    let phys_base = phys::alloc_contiguous(pages).map_err(|_| DmaError::NoContiguousFrames)?;

    let virt = kheap::kmalloc_aligned(pages * PAGE_SIZE, PAGE_SIZE);
    if virt.is_null() {
        for i in 0..pages {
            phys::free_frame(phys_base.offset((i * PAGE_SIZE) as u64));
        }
        return Err(DmaError::HeapExhausted);
    }

    // Re-point each heap page at the contiguous range. The displaced heap
    // frames stay allocated; dma_free restores them.
    for i in 0..pages {
        let va = VirtualAddress::new(virt as u64 + (i * PAGE_SIZE) as u64);
        let pa = phys_base.offset((i * PAGE_SIZE) as u64);
        if paging::map_page(va, pa, PageFlags::PRESENT | PageFlags::WRITABLE).is_err() {
            // Roll back: restore already re-pointed pages, then release.
            restore_heap_backing(virt, i);
            kheap::kfree(virt);
            for j in 0..pages {
                phys::free_frame(phys_base.offset((j * PAGE_SIZE) as u64));
            }
            return Err(DmaError::RemapFailed);
        }
    }

    let buf = DmaBuffer { virt, phys: phys_base, size: pages * PAGE_SIZE };

    // SAFETY: The whole buffer was just mapped writable.
    unsafe { core::ptr::write_bytes(buf.virt, 0, buf.size) };

    Ok(buf)
}

/// Release a DMA buffer: free the contiguous frames, restore the heap
/// allocation's original backing and return it to the heap.
pub fn dma_free(buf: &mut DmaBuffer) {
    if buf.virt.is_null() || buf.phys.is_null() || buf.size == 0 {
        return;
    }

    let pages = buf.size / PAGE_SIZE;
    restore_heap_backing(buf.virt, pages);
    for i in 0..pages {
        phys::free_frame(buf.phys.offset((i * PAGE_SIZE) as u64));
    }
    kheap::kfree(buf.virt);

    buf.virt = core::ptr::null_mut();
    buf.phys = PhysicalAddress::new(0);
    buf.size = 0;
}

/// Re-point the first `pages` pages of an aligned heap allocation back at
/// their original contiguous heap frames.
fn restore_heap_backing(virt: *mut u8, pages: usize) {
    if pages == 0 {
        return;
    }
    // The allocation header records the contiguous physical base of the
    // whole allocation; the page's original frame is that base plus the
    // page's offset within the allocation.
    let (alloc_base, alloc_phys) = match kheap::allocation_backing(virt) {
        Some(v) => v,
        None => return,
    };
    let first_page_index = (virt as u64 - alloc_base) / PAGE_SIZE as u64;
    for i in 0..pages as u64 {
        let va = VirtualAddress::new(virt as u64 + i * PAGE_SIZE as u64);
        let original = alloc_phys + (first_page_index + i) * PAGE_SIZE as u64;
        let _ = paging::map_page(
            va,
            PhysicalAddress::new(original),
            PageFlags::PRESENT | PageFlags::WRITABLE,
        );
    }
}
