//! ELF64 program loader
//!
//! Validates an in-memory ELF image and maps its PT_LOAD segments into the
//! current address space, backing each segment with physically contiguous
//! frames. Stale mappings inside a segment's range are removed first, so
//! exec-ing into the same addresses is clean. The entry point and any
//! arguments are handed to process creation, whose first run sees
//! `(argc, argv)` per the kernel ABI.

use core::mem;

use crate::error::KernelError;
use crate::mm::{paging, phys, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const EM_X86_64: u16 = 0x3E;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooSmall,
    BadMagic,
    Not64Bit,
    NotLittleEndian,
    WrongMachine,
    NotExecutable,
    HeadersOutOfBounds,
    SegmentOutOfBounds,
    OutOfMemory,
    MapFailed,
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        match e {
            ElfError::OutOfMemory => KernelError::OutOfMemory,
            _ => KernelError::InvalidArgument { name: "elf image" },
        }
    }
}

/// Validate the identification and machine fields.
pub fn validate(data: &[u8]) -> Result<&Elf64Header, ElfError> {
    if data.len() < mem::size_of::<Elf64Header>() {
        return Err(ElfError::TooSmall);
    }
    // SAFETY: Length checked; Elf64Header is repr(C) plain data readable
    // from any sufficiently long byte buffer.
    let header = unsafe { &*(data.as_ptr() as *const Elf64Header) };

    if header.magic != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if header.class != ELF_CLASS_64 {
        return Err(ElfError::Not64Bit);
    }
    if header.data != ELF_DATA_2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if header.machine != EM_X86_64 {
        return Err(ElfError::WrongMachine);
    }
    if header.elf_type != ET_EXEC && header.elf_type != ET_DYN {
        return Err(ElfError::NotExecutable);
    }
    Ok(header)
}

/// Program-header slice of a validated image.
fn program_headers<'a>(
    data: &'a [u8],
    header: &Elf64Header,
) -> Result<&'a [Elf64ProgramHeader], ElfError> {
    if header.phoff == 0 || header.phnum == 0 {
        return Ok(&[]);
    }
    let start = header.phoff as usize;
    let size = header.phentsize as usize;
    let count = header.phnum as usize;
    if size < mem::size_of::<Elf64ProgramHeader>()
        || start.checked_add(size * count).is_none_or(|end| end > data.len())
    {
        return Err(ElfError::HeadersOutOfBounds);
    }
    // SAFETY: Bounds checked above; entries are repr(C) plain data.
    Ok(unsafe {
        core::slice::from_raw_parts(data.as_ptr().add(start) as *const Elf64ProgramHeader, count)
    })
}

/// Page-span of one loadable segment: aligned base and page count.
pub(crate) fn segment_span(vaddr: u64, memsz: u64) -> (u64, usize) {
    let page_offset = vaddr & (PAGE_SIZE as u64 - 1);
    let base = vaddr & !(PAGE_SIZE as u64 - 1);
    // Saturate on absurd sizes; the frame allocator rejects them anyway.
    let total = memsz.saturating_add(page_offset);
    let pages = total.div_ceil(PAGE_SIZE as u64) as usize;
    (base, pages)
}

/// Map every PT_LOAD segment and copy its file bytes; returns the entry.
pub fn load(data: &[u8]) -> Result<u64, ElfError> {
    let header = validate(data)?;
    let phdrs = program_headers(data, header)?;

    log::info!("loading {} program headers", phdrs.len());

    for ph in phdrs {
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.filesz > ph.memsz {
            return Err(ElfError::SegmentOutOfBounds);
        }
        let offset = ph.offset as usize;
        let filesz = ph.filesz as usize;
        if offset.checked_add(filesz).is_none_or(|end| end > data.len()) {
            return Err(ElfError::SegmentOutOfBounds);
        }

        let (vaddr_aligned, num_pages) = segment_span(ph.vaddr, ph.memsz);
        let aligned_size = num_pages as u64 * PAGE_SIZE as u64;

        // Exec-into-same-address-space: drop any stale mapping first.
        let mut unmapped_any = false;
        for p in 0..num_pages {
            let va = VirtualAddress::new(vaddr_aligned + (p * PAGE_SIZE) as u64);
            if paging::virt_to_phys(va).is_some() {
                if !unmapped_any {
                    log::warn!("segment range already mapped; unmapping first");
                    unmapped_any = true;
                }
                let _ = paging::unmap_page(va);
            }
        }
        if unmapped_any {
            crate::arch::flush_tlb_all();
        }

        let phys_base = phys::alloc_contiguous(num_pages).map_err(|_| ElfError::OutOfMemory)?;

        log::debug!(
            "segment {:#x} -> {:#x} ({} pages)",
            vaddr_aligned,
            phys_base.as_u64(),
            num_pages
        );

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if paging::map_range(
            VirtualAddress::new(vaddr_aligned),
            phys_base,
            aligned_size,
            flags,
        )
        .is_err()
        {
            for p in 0..num_pages {
                phys::free_frame(PhysicalAddress::new(
                    phys_base.as_u64() + (p * PAGE_SIZE) as u64,
                ));
            }
            return Err(ElfError::MapFailed);
        }
        crate::arch::flush_tlb_all();

        // SAFETY: The whole aligned range was just mapped writable; the
        // copy source was bounds-checked against the image.
        unsafe {
            core::ptr::write_bytes(vaddr_aligned as *mut u8, 0, aligned_size as usize);
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(offset),
                ph.vaddr as *mut u8,
                filesz,
            );
        }
        log::debug!("copied {} bytes", filesz);
    }

    log::info!("ELF loaded, entry {:#x}", header.entry);
    Ok(header.entry)
}

/// Load an image and create a process running it with `args`.
///
/// The process gets its own top-level table, cloned from the kernel table
/// after the segments are mapped so the fresh image is visible through it.
pub fn spawn(name: &str, data: &[u8], priority: u8, args: &[&str]) -> Result<u32, KernelError> {
    let entry = load(data)?;
    let pml4 = paging::create_process_pml4();
    crate::process::create_at(name, entry, priority, args, pml4)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use super::*;

    fn minimal_header() -> Vec<u8> {
        let mut h = vec![0u8; mem::size_of::<Elf64Header>()];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELF_CLASS_64;
        h[5] = ELF_DATA_2LSB;
        h[6] = 1; // version
        h[16] = 2; // ET_EXEC
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        h
    }

    #[test]
    fn accepts_a_wellformed_exec_header() {
        let image = minimal_header();
        let h = validate(&image).expect("valid header");
        assert_eq!(h.entry, 0x40_0000);
        assert_eq!(h.elf_type, ET_EXEC);
    }

    #[test]
    fn accepts_et_dyn() {
        let mut image = minimal_header();
        image[16] = 3; // ET_DYN
        assert!(validate(&image).is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = minimal_header();
        image[0] = 0x7E;
        assert_eq!(validate(&image), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_32bit_and_big_endian() {
        let mut image = minimal_header();
        image[4] = 1;
        assert_eq!(validate(&image), Err(ElfError::Not64Bit));

        let mut image = minimal_header();
        image[5] = 2;
        assert_eq!(validate(&image), Err(ElfError::NotLittleEndian));
    }

    #[test]
    fn rejects_foreign_machine_and_relocatable() {
        let mut image = minimal_header();
        image[18] = 0xB7; // aarch64
        image[19] = 0;
        assert_eq!(validate(&image), Err(ElfError::WrongMachine));

        let mut image = minimal_header();
        image[16] = 1; // ET_REL
        assert_eq!(validate(&image), Err(ElfError::NotExecutable));
    }

    #[test]
    fn rejects_truncated_images() {
        assert_eq!(validate(&[0x7F, b'E']), Err(ElfError::TooSmall));
    }

    #[test]
    fn segment_span_includes_intra_page_offset() {
        // Page-aligned segment: vaddr 0x400000, memsz 0x1000 -> one page.
        assert_eq!(segment_span(0x40_0000, 0x1000), (0x40_0000, 1));
        // Offset pushes the span over a page boundary.
        assert_eq!(segment_span(0x40_0FF0, 0x20), (0x40_0000, 2));
        assert_eq!(segment_span(0x40_0800, 0x1000), (0x40_0000, 2));
    }

    #[test]
    fn program_header_bounds_are_enforced() {
        let mut image = minimal_header();
        // Claim 4 headers at an offset beyond the image.
        image[32..40].copy_from_slice(&(image.len() as u64).to_le_bytes()); // phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        image[56..58].copy_from_slice(&4u16.to_le_bytes()); // phnum
        let h = validate(&image).expect("header itself is fine");
        assert_eq!(program_headers(&image, h), Err(ElfError::HeadersOutOfBounds));
    }
}
