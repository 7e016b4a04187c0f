//! 4-level x86_64 paging
//!
//! The kernel owns one top-level table, built at boot by copying every
//! present entry from the bootloader's table (preserving its identity
//! mapping). Per-process top-level tables are value-copies of the kernel
//! table with the low half left to the program loader.
//!
//! Physical frames holding page tables are reached through `phys_to_virt`:
//! identity while `phys_offset` is zero, `phys + offset` once a direct map
//! has been established and announced via [`set_phys_offset`].

use spin::Mutex;

use super::{phys, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::error::KernelError;

const PT_ENTRIES: usize = 512;
const PAGE_MASK: u64 = !0xFFF;
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const HUGE_2M_ADDR_MASK: u64 = 0x000F_FFFF_FFE0_0000;
const HUGE_2M_SIZE: u64 = 2 * 1024 * 1024;

/// Base of the MMIO remap window, well clear of the kernel heap.
pub const IOREMAP_BASE: u64 = 0xFFFF_A000_0000_0000;

struct Paging {
    pml4_virt: *mut u64,
    pml4_phys: u64,
    phys_offset: u64,
    ioremap_next: u64,
}

// SAFETY: The raw table pointer is only dereferenced under the PAGING lock
// on a single CPU.
unsafe impl Send for Paging {}

static PAGING: Mutex<Paging> = Mutex::new(Paging {
    pml4_virt: core::ptr::null_mut(),
    pml4_phys: 0,
    phys_offset: 0,
    ioremap_next: IOREMAP_BASE,
});

/// Split a canonical virtual address into its four table indices.
pub(crate) fn table_indices(virt: u64) -> (usize, usize, usize, usize) {
    (
        ((virt >> 39) & 0x1FF) as usize,
        ((virt >> 30) & 0x1FF) as usize,
        ((virt >> 21) & 0x1FF) as usize,
        ((virt >> 12) & 0x1FF) as usize,
    )
}

impl Paging {
    fn phys_to_virt(&self, phys: u64) -> *mut u64 {
        if phys == 0 {
            return core::ptr::null_mut();
        }
        (phys + self.phys_offset) as *mut u64
    }

    /// Allocate and zero one page-table page; returns (virt, phys).
    fn alloc_table_page(&self) -> Option<(*mut u64, u64)> {
        let frame = phys::alloc_frame().ok()?;
        let virt = self.phys_to_virt(frame.as_u64());
        if virt.is_null() {
            return None;
        }
        // SAFETY: The frame was just allocated and is reachable through the
        // current phys->virt convention; zeroing a full table page.
        unsafe { core::ptr::write_bytes(virt, 0, PT_ENTRIES) };
        Some((virt, frame.as_u64()))
    }

    /// Get the next-level table under `table[idx]`, allocating if absent.
    ///
    /// # Safety
    ///
    /// `table` must point at a live page-table page.
    unsafe fn get_or_create(&self, table: *mut u64, idx: usize) -> Option<*mut u64> {
        // SAFETY: Caller guarantees `table` points at a live table page.
        let entry = unsafe { *table.add(idx) };
        if entry & PageFlags::PRESENT.bits() != 0 {
            return Some(self.phys_to_virt(entry & ENTRY_ADDR_MASK));
        }
        let (next_virt, next_phys) = self.alloc_table_page()?;
        let new_entry =
            (next_phys & PAGE_MASK) | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
        // SAFETY: idx < 512 (masked by the index extraction); writes one
        // 64-bit entry inside the table page.
        unsafe { *table.add(idx) = new_entry };
        Some(next_virt)
    }

    /// Walk to the PTE slot for `virt`, allocating intermediate tables.
    fn walk_create(&self, virt: u64) -> Option<*mut u64> {
        let (i4, i3, i2, i1) = table_indices(virt);
        // SAFETY: pml4_virt points at the live kernel PML4; each returned
        // pointer is a live table page.
        unsafe {
            let pdpt = self.get_or_create(self.pml4_virt, i4)?;
            let pd = self.get_or_create(pdpt, i3)?;
            let pt = self.get_or_create(pd, i2)?;
            Some(pt.add(i1))
        }
    }

    /// Walk to the PTE slot for `virt` without allocating; `None` when any
    /// level is absent.
    fn walk(&self, virt: u64) -> Option<*mut u64> {
        let (i4, i3, i2, i1) = table_indices(virt);
        let mut table = self.pml4_virt;
        if table.is_null() {
            return None;
        }
        for idx in [i4, i3, i2] {
            // SAFETY: `table` points at a live table page; idx < 512.
            let entry = unsafe { *table.add(idx) };
            if entry & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            table = self.phys_to_virt(entry & ENTRY_ADDR_MASK);
        }
        // SAFETY: the PT page is live; i1 < 512.
        Some(unsafe { table.add(i1) })
    }
}

/// Allocate the kernel top-level table and copy the bootloader's present
/// entries, then switch CR3 to it.
pub fn init() {
    let mut paging = PAGING.lock();
    if !paging.pml4_virt.is_null() {
        log::warn!("paging already initialized");
        return;
    }

    let old_cr3 = crate::arch::read_cr3();
    log::info!("bootloader CR3 {:#x}", old_cr3);

    let Some((new_virt, new_phys)) = paging.alloc_table_page() else {
        log::error!("cannot allocate top-level table");
        return;
    };

    let old_virt = paging.phys_to_virt(old_cr3 & PAGE_MASK);
    for i in 0..PT_ENTRIES {
        // SAFETY: Both tables are live page-table pages; preserving exactly
        // the bootloader's present entries.
        unsafe {
            let e = *old_virt.add(i);
            *new_virt.add(i) = if e & PageFlags::PRESENT.bits() != 0 { e } else { 0 };
        }
    }

    paging.pml4_virt = new_virt;
    paging.pml4_phys = new_phys;

    // Materialize the top-level entries for the kernel heap and MMIO
    // windows now, before any process table is cloned. Process tables copy
    // top-level entries by value; with the PDPTs in place up front, later
    // kernel mappings only touch shared lower levels.
    for window in [super::kheap::KHEAP_START, IOREMAP_BASE] {
        let (i4, _, _, _) = table_indices(window);
        // SAFETY: pml4_virt is the live table just built.
        unsafe {
            let _ = paging.get_or_create(paging.pml4_virt, i4);
        }
    }

    crate::arch::write_cr3(new_phys);
    log::info!("kernel top-level table installed at {:#x}", new_phys);
}

/// Announce a direct-map offset for phys->virt table access.
///
/// The caller must have mapped `[0, tracked RAM)` at `offset` first.
pub fn set_phys_offset(offset: u64) {
    PAGING.lock().phys_offset = offset;
}

pub fn kernel_pml4_phys() -> PhysicalAddress {
    PhysicalAddress::new(PAGING.lock().pml4_phys)
}

/// Map one 4 KiB page. Present is always set; `flags` supplies the rest of
/// the low 12 bits. The TLB entry is invalidated.
pub fn map_page(
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), KernelError> {
    crate::arch::without_interrupts(|| {
        let paging = PAGING.lock();
        if paging.pml4_virt.is_null() {
            return Err(KernelError::NotInitialized { subsystem: "paging" });
        }
        let slot = paging.walk_create(virt.as_u64()).ok_or(KernelError::OutOfMemory)?;
        let entry = (phys.as_u64() & PAGE_MASK)
            | (flags.bits() & 0xFFF)
            | PageFlags::PRESENT.bits();
        // SAFETY: `slot` is a live PTE slot returned by walk_create.
        unsafe { *slot = entry };
        crate::arch::invlpg(virt.as_u64());
        Ok(())
    })
}

/// Remove the mapping for one page and invalidate its TLB entry.
pub fn unmap_page(virt: VirtualAddress) -> Result<(), KernelError> {
    crate::arch::without_interrupts(|| {
        let paging = PAGING.lock();
        let slot = paging
            .walk(virt.as_u64())
            .ok_or(KernelError::UnmappedMemory { addr: virt.as_u64() })?;
        // SAFETY: `slot` is a live PTE slot.
        unsafe { *slot = 0 };
        crate::arch::invlpg(virt.as_u64());
        Ok(())
    })
}

/// Map `size` bytes (rounded up to whole pages) page by page.
pub fn map_range(
    virt_base: VirtualAddress,
    phys_base: PhysicalAddress,
    size: u64,
    flags: PageFlags,
) -> Result<(), KernelError> {
    let pages = size.div_ceil(PAGE_SIZE as u64);
    for i in 0..pages {
        let virt = virt_base.offset(i * PAGE_SIZE as u64);
        let phys = phys_base.offset(i * PAGE_SIZE as u64);
        if let Err(e) = map_page(virt, phys, flags) {
            log::error!("failed to map page at virt={:#x}", virt.as_u64());
            return Err(e);
        }
    }
    Ok(())
}

/// Map one 2 MiB page with the PS bit at the third level.
///
/// `virt` and `phys` must be 2 MiB aligned; used by the large identity
/// mapping passes during bring-up.
pub fn map_2m_page(
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), KernelError> {
    if virt.as_u64() % HUGE_2M_SIZE != 0 || phys.as_u64() % HUGE_2M_SIZE != 0 {
        return Err(KernelError::InvalidArgument { name: "2 MiB alignment" });
    }
    crate::arch::without_interrupts(|| {
        let paging = PAGING.lock();
        if paging.pml4_virt.is_null() {
            return Err(KernelError::NotInitialized { subsystem: "paging" });
        }
        let (i4, i3, i2, _) = table_indices(virt.as_u64());
        // SAFETY: pml4_virt is live; returned tables are live table pages.
        unsafe {
            let pdpt = paging
                .get_or_create(paging.pml4_virt, i4)
                .ok_or(KernelError::OutOfMemory)?;
            let pd = paging.get_or_create(pdpt, i3).ok_or(KernelError::OutOfMemory)?;
            let entry = (phys.as_u64() & HUGE_2M_ADDR_MASK)
                | (flags.bits() & 0xFFF)
                | (PageFlags::PRESENT | PageFlags::HUGE).bits();
            *pd.add(i2) = entry;
        }
        crate::arch::invlpg(virt.as_u64());
        Ok(())
    })
}

/// Map a 2 MiB-aligned range with huge pages.
pub fn map_2m_range(
    virt_base: VirtualAddress,
    phys_base: PhysicalAddress,
    size: u64,
    flags: PageFlags,
) -> Result<(), KernelError> {
    let count = size.div_ceil(HUGE_2M_SIZE);
    for i in 0..count {
        map_2m_page(
            virt_base.offset(i * HUGE_2M_SIZE),
            phys_base.offset(i * HUGE_2M_SIZE),
            flags,
        )?;
    }
    Ok(())
}

/// Translate a virtual address through the kernel table.
///
/// Follows 2 MiB huge pages at the third level. `None` when any level is
/// absent.
pub fn virt_to_phys(virt: VirtualAddress) -> Option<PhysicalAddress> {
    crate::arch::without_interrupts(|| {
        let paging = PAGING.lock();
        if paging.pml4_virt.is_null() {
            return None;
        }
        let v = virt.as_u64();
        let (i4, i3, i2, i1) = table_indices(v);

        // SAFETY: Every pointer below is derived from a present entry of a
        // live page-table page under the PAGING lock.
        unsafe {
            let e4 = *paging.pml4_virt.add(i4);
            if e4 & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            let pdpt = paging.phys_to_virt(e4 & ENTRY_ADDR_MASK);
            let e3 = *pdpt.add(i3);
            if e3 & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            let pd = paging.phys_to_virt(e3 & ENTRY_ADDR_MASK);
            let e2 = *pd.add(i2);
            if e2 & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            if e2 & PageFlags::HUGE.bits() != 0 {
                return Some(PhysicalAddress::new(
                    (e2 & HUGE_2M_ADDR_MASK) | (v & (HUGE_2M_SIZE - 1)),
                ));
            }
            let pt = paging.phys_to_virt(e2 & ENTRY_ADDR_MASK);
            let e1 = *pt.add(i1);
            if e1 & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            Some(PhysicalAddress::new((e1 & ENTRY_ADDR_MASK) | (v & 0xFFF)))
        }
    })
}

/// Allocate a per-process top-level table.
///
/// Present kernel entries are copied by value so kernel code, the heap and
/// the MMIO window stay addressable; the low half is populated later by the
/// program loader.
pub fn create_process_pml4() -> Option<PhysicalAddress> {
    crate::arch::without_interrupts(|| {
        let paging = PAGING.lock();
        if paging.pml4_virt.is_null() {
            return None;
        }
        let (new_virt, new_phys) = paging.alloc_table_page()?;
        for i in 0..PT_ENTRIES {
            // SAFETY: Both tables are live page-table pages.
            unsafe {
                let e = *paging.pml4_virt.add(i);
                *new_virt.add(i) = if e & PageFlags::PRESENT.bits() != 0 { e } else { 0 };
            }
        }
        Some(PhysicalAddress::new(new_phys))
    })
}

/// Map a range into a specific top-level table (used when building a
/// process image in a non-current address space).
pub fn map_range_to_pml4(
    pml4_phys: PhysicalAddress,
    virt_base: VirtualAddress,
    phys_base: PhysicalAddress,
    size: u64,
    flags: PageFlags,
) -> Result<(), KernelError> {
    crate::arch::without_interrupts(|| {
        let paging = PAGING.lock();
        let pml4_virt = paging.phys_to_virt(pml4_phys.as_u64());
        if pml4_virt.is_null() {
            return Err(KernelError::InvalidArgument { name: "pml4_phys" });
        }
        let pages = size.div_ceil(PAGE_SIZE as u64);
        for i in 0..pages {
            let v = virt_base.as_u64() + i * PAGE_SIZE as u64;
            let p = phys_base.as_u64() + i * PAGE_SIZE as u64;
            let (i4, i3, i2, i1) = table_indices(v);
            // SAFETY: pml4_virt points at a table page allocated by
            // create_process_pml4; intermediate tables come from
            // get_or_create and are live.
            unsafe {
                let pdpt = paging
                    .get_or_create(pml4_virt, i4)
                    .ok_or(KernelError::OutOfMemory)?;
                let pd = paging.get_or_create(pdpt, i3).ok_or(KernelError::OutOfMemory)?;
                let pt = paging.get_or_create(pd, i2).ok_or(KernelError::OutOfMemory)?;
                *pt.add(i1) =
                    (p & PAGE_MASK) | (flags.bits() & 0xFFF) | PageFlags::PRESENT.bits();
            }
        }
        Ok(())
    })
}

fn ioremap_inner(phys_addr: u64, size: u64, guard: bool) -> Option<VirtualAddress> {
    if size == 0 {
        return None;
    }
    let page_offset = phys_addr & (PAGE_SIZE as u64 - 1);
    let phys_base = phys_addr & PAGE_MASK;
    let pages = (size + page_offset).div_ceil(PAGE_SIZE as u64);

    let virt_base = {
        let mut paging = PAGING.lock();
        let base = paging.ioremap_next;
        // The guard page stays unmapped; a write past the end of the
        // mapping faults instead of corrupting the next mapping.
        paging.ioremap_next += (pages + if guard { 1 } else { 0 }) * PAGE_SIZE as u64;
        base
    };

    let flags = PageFlags::WRITABLE | PageFlags::NO_CACHE | PageFlags::WRITE_THROUGH;
    if map_range(
        VirtualAddress::new(virt_base),
        PhysicalAddress::new(phys_base),
        pages * PAGE_SIZE as u64,
        flags,
    )
    .is_err()
    {
        return None;
    }
    Some(VirtualAddress::new(virt_base + page_offset))
}

/// Map an MMIO physical range into the dedicated higher-half window.
pub fn ioremap(phys_addr: u64, size: u64) -> Option<VirtualAddress> {
    ioremap_inner(phys_addr, size, false)
}

/// Like [`ioremap`], plus one unmapped trap page after the mapping.
pub fn ioremap_guarded(phys_addr: u64, size: u64) -> Option<VirtualAddress> {
    ioremap_inner(phys_addr, size, true)
}

/// Install a PTE for a kernel-heap page during demand fill.
///
/// Requires every parent level to already exist; missing parents mean the
/// fault is outside anything the heap ever reserved and are reported as
/// unmapped.
pub fn install_heap_pte(virt: VirtualAddress, phys: PhysicalAddress) -> Result<(), KernelError> {
    let paging = PAGING.lock();
    let slot = paging
        .walk(virt.as_u64())
        .ok_or(KernelError::UnmappedMemory { addr: virt.as_u64() })?;
    // SAFETY: `slot` is a live PTE slot; the new frame was just allocated.
    unsafe {
        if *slot & PageFlags::PRESENT.bits() != 0 {
            return Err(KernelError::InvalidState { expected: "non-present PTE" });
        }
        *slot = (phys.as_u64() & PAGE_MASK)
            | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
    }
    crate::arch::invlpg(virt.as_u64());
    Ok(())
}

/// Best-effort dump of the translation path for a faulting address.
pub fn dump_walk(virt: u64) {
    let paging = PAGING.lock();
    if paging.pml4_virt.is_null() {
        log::error!("walk {:#x}: paging not initialized", virt);
        return;
    }
    let (i4, i3, i2, i1) = table_indices(virt);
    let mut table = paging.pml4_virt;
    for (level, idx) in [(4, i4), (3, i3), (2, i2), (1, i1)] {
        // SAFETY: `table` points at a live table page under the lock.
        let entry = unsafe { *table.add(idx) };
        log::error!("  L{}[{}] = {:#018x}", level, idx, entry);
        if entry & PageFlags::PRESENT.bits() == 0 || entry & PageFlags::HUGE.bits() != 0 {
            return;
        }
        table = paging.phys_to_virt(entry & ENTRY_ADDR_MASK);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn index_extraction() {
        // 0xFFFF_8000_0000_0000 -> PML4 index 256, rest zero.
        let (i4, i3, i2, i1) = table_indices(0xFFFF_8000_0000_0000);
        assert_eq!((i4, i3, i2, i1), (256, 0, 0, 0));

        let (i4, i3, i2, i1) = table_indices(0x0000_0000_0040_0000);
        assert_eq!((i4, i3, i2, i1), (0, 0, 2, 0));
    }

    #[test]
    fn indices_cover_nine_bits() {
        let virt = (511u64 << 39) | (511 << 30) | (511 << 21) | (511 << 12);
        let (i4, i3, i2, i1) = table_indices(virt);
        assert_eq!((i4, i3, i2, i1), (511, 511, 511, 511));
    }
}
