//! System call numbers and dispatch
//!
//! Numbers are part of the userland ABI and never change meaning. The
//! dispatcher implements the process/memory/input/statistics calls in the
//! core; filesystem, console-color and graphics calls belong to external
//! collaborators, which register their handlers at boot. An unregistered
//! or unknown call returns -1.

pub mod usercopy;

use spin::Mutex;

/// Stable syscall numbers (shared with userland).
pub mod nr {
    pub const EXIT: u64 = 0;
    pub const FORK: u64 = 1;
    pub const READ: u64 = 2;
    pub const WRITE: u64 = 3;
    pub const OPEN: u64 = 4;
    pub const CLOSE: u64 = 5;
    pub const WAIT: u64 = 6;
    pub const EXEC: u64 = 7;
    pub const GETPID: u64 = 8;
    pub const GETPPID: u64 = 9;
    pub const SLEEP: u64 = 10;
    pub const YIELD: u64 = 11;
    pub const MALLOC: u64 = 12;
    pub const FREE: u64 = 13;
    pub const SBRK: u64 = 14;
    pub const KILL: u64 = 15;
    pub const TIME: u64 = 16;
    pub const CHDIR: u64 = 17;
    pub const GETCWD: u64 = 18;
    pub const STAT: u64 = 19;
    pub const MKDIR: u64 = 20;
    pub const RMDIR: u64 = 21;
    pub const UNLINK: u64 = 22;
    pub const LSEEK: u64 = 23;
    pub const WRITEFILE: u64 = 24;
    pub const OPENDIR: u64 = 25;
    pub const READDIR: u64 = 26;
    pub const CLOSEDIR: u64 = 27;
    pub const INPUT: u64 = 28;
    pub const SSTATS: u64 = 29;
    pub const VGA_SET_COLOR: u64 = 30;
    pub const VGA_GET_COLOR: u64 = 31;
    pub const VGA_RESET_COLOR: u64 = 32;
    pub const GETUID: u64 = 33;
    pub const SETUID: u64 = 34;
    pub const GFX_BLIT: u64 = 35;
    pub const VFS_MKFS: u64 = 36;
    pub const VFS_GETPART: u64 = 37;
    /// Fill a user buffer with a [`super::SysInfo`].
    pub const SSTATS2: u64 = 38;
    pub const MMAP: u64 = 39;
    pub const MUNMAP: u64 = 40;
}

/// Highest syscall number + 1.
pub const SYSCALL_COUNT: usize = 41;

/// Generic failure return.
const EFAIL: i64 = -1;

/// Handler signature for externally provided syscalls (devfs, VFS, console
/// color, graphics). Arguments are the raw syscall arguments.
pub type ExternalHandler = fn(u64, u64, u64, u64) -> i64;

static EXTERNAL: Mutex<[Option<ExternalHandler>; SYSCALL_COUNT]> =
    Mutex::new([None; SYSCALL_COUNT]);

/// Install an external collaborator's handler for one syscall number.
pub fn register_external(num: u64, handler: ExternalHandler) {
    if (num as usize) < SYSCALL_COUNT {
        EXTERNAL.lock()[num as usize] = Some(handler);
    }
}

fn external(num: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    let handler = EXTERNAL.lock()[num as usize];
    match handler {
        Some(h) => h(a1, a2, a3, a4),
        None => EFAIL,
    }
}

/// System information record filled by `sstats2`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SysInfo {
    pub total_frames: u64,
    pub free_frames: u64,
    pub used_frames: u64,
    pub heap_allocations: u64,
    pub heap_failed_allocations: u64,
    pub uptime_ms: u64,
    pub process_count: u64,
}

/// The kernel-side syscall dispatcher.
///
/// Called by the SYSCALL entry stub with the number in the first argument
/// and arguments 1..4 following (user registers rdi, rsi, rdx, r10).
#[no_mangle]
pub extern "C" fn syscall_handler(num: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    match num {
        nr::EXIT => crate::process::exit(a1 as i32),
        nr::FORK => EFAIL, // single-address-space kernel: exec-style creation only
        nr::WRITE => sys_write(a1, a2, a3),
        nr::GETPID => crate::process::current_pid() as i64,
        nr::GETPPID => sys_getppid(),
        nr::SLEEP => {
            crate::process::sleep(a1);
            0
        }
        nr::YIELD => {
            crate::process::yield_now();
            0
        }
        nr::MALLOC => crate::mm::kheap::kmalloc(a1 as usize) as i64,
        nr::FREE => {
            crate::mm::kheap::kfree(a1 as *mut u8);
            0
        }
        nr::SBRK => EFAIL, // userland allocates through malloc/mmap
        nr::KILL => match crate::process::kill(a1 as u32) {
            Ok(()) => 0,
            Err(_) => EFAIL,
        },
        nr::TIME => crate::arch::x86_64::timer::uptime_ms() as i64,
        nr::INPUT => sys_input(a1),
        nr::SSTATS => {
            crate::mm::kheap::log_stats();
            0
        }
        nr::SSTATS2 => sys_sstats2(a1),
        nr::GETUID => sys_getuid(),
        nr::SETUID => sys_setuid(a1 as u32),
        nr::MMAP => sys_mmap(a1, a2),
        nr::MUNMAP => sys_munmap(a1, a2),
        // Filesystem, console color and graphics belong to external
        // collaborators.
        nr::READ
        | nr::OPEN
        | nr::CLOSE
        | nr::WAIT
        | nr::EXEC
        | nr::CHDIR
        | nr::GETCWD
        | nr::STAT
        | nr::MKDIR
        | nr::RMDIR
        | nr::UNLINK
        | nr::LSEEK
        | nr::WRITEFILE
        | nr::OPENDIR
        | nr::READDIR
        | nr::CLOSEDIR
        | nr::VGA_SET_COLOR
        | nr::VGA_GET_COLOR
        | nr::VGA_RESET_COLOR
        | nr::GFX_BLIT
        | nr::VFS_MKFS
        | nr::VFS_GETPART => external(num, a1, a2, a3, a4),
        _ => {
            log::warn!("unknown syscall {}", num);
            EFAIL
        }
    }
}

/// `write(fd, buf, len)`: fds 1 and 2 go to the serial console; everything
/// else belongs to the external file layer.
fn sys_write(fd: u64, buf: u64, len: u64) -> i64 {
    if fd != 1 && fd != 2 {
        return external(nr::WRITE, fd, buf, len, 0);
    }
    let len = (len as usize).min(4096);
    if !usercopy::in_user_half(buf, len) {
        return EFAIL;
    }
    let mut chunk = [0u8; 256];
    let mut written = 0usize;
    while written < len {
        let n = (len - written).min(chunk.len());
        if usercopy::copy_from_user(&mut chunk[..n], buf + written as u64).is_err() {
            return if written > 0 { written as i64 } else { EFAIL };
        }
        if let Ok(s) = core::str::from_utf8(&chunk[..n]) {
            crate::print!("{}", s);
        } else {
            for &b in &chunk[..n] {
                crate::print!("{}", b as char);
            }
        }
        written += n;
    }
    written as i64
}

fn sys_getppid() -> i64 {
    match crate::process::current() {
        // SAFETY: The current process is live.
        Some(p) => unsafe { p.as_ref().parent_pid as i64 },
        None => 0,
    }
}

/// `input(event_ptr)`: pop one event into the user buffer; 1 when an event
/// was delivered, 0 when the queue was empty.
fn sys_input(user_event: u64) -> i64 {
    let Some(event) = crate::events::poll() else {
        return 0;
    };
    // SAFETY: Event is repr(C) plain data; viewing it as bytes is sound.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &event as *const crate::events::Event as *const u8,
            core::mem::size_of::<crate::events::Event>(),
        )
    };
    match usercopy::copy_to_user(user_event, bytes) {
        Ok(()) => 1,
        Err(_) => EFAIL,
    }
}

fn sys_sstats2(user_buf: u64) -> i64 {
    let frames = crate::arch::without_interrupts(|| crate::mm::phys::FRAME_ALLOCATOR.lock().stats());
    let heap = crate::mm::kheap::kheap_stats();
    let info = SysInfo {
        total_frames: frames.total_frames,
        free_frames: frames.free_frames,
        used_frames: frames.used_frames,
        heap_allocations: heap.total_allocations,
        heap_failed_allocations: heap.failed_allocations,
        uptime_ms: crate::arch::x86_64::timer::uptime_ms(),
        process_count: crate::process::table::count() as u64,
    };
    // SAFETY: SysInfo is repr(C) plain data.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &info as *const SysInfo as *const u8,
            core::mem::size_of::<SysInfo>(),
        )
    };
    match usercopy::copy_to_user(user_buf, bytes) {
        Ok(()) => 0,
        Err(_) => EFAIL,
    }
}

fn sys_getuid() -> i64 {
    match crate::process::current() {
        // SAFETY: The current process is live.
        Some(p) => unsafe { p.as_ref().uid as i64 },
        None => 0,
    }
}

/// Only root may change identity.
fn sys_setuid(uid: u32) -> i64 {
    let Some(cur) = crate::process::current() else {
        return EFAIL;
    };
    // SAFETY: The current process is live; single writer.
    unsafe {
        let c = cur.as_mut();
        if c.uid != 0 {
            return EFAIL;
        }
        c.uid = uid;
    }
    0
}

/// Anonymous mapping at a caller-chosen address (dynamic-linker support).
fn sys_mmap(addr: u64, length: u64) -> i64 {
    use crate::mm::{paging, phys, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};

    if length == 0 || addr % PAGE_SIZE as u64 != 0 || !usercopy::in_user_half(addr, length as usize)
    {
        return EFAIL;
    }
    let pages = length.div_ceil(PAGE_SIZE as u64) as usize;
    let Ok(phys_base) = phys::alloc_contiguous(pages) else {
        return EFAIL;
    };
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
    if paging::map_range(
        VirtualAddress::new(addr),
        phys_base,
        pages as u64 * PAGE_SIZE as u64,
        flags,
    )
    .is_err()
    {
        for i in 0..pages {
            phys::free_frame(PhysicalAddress::new(
                phys_base.as_u64() + (i * PAGE_SIZE) as u64,
            ));
        }
        return EFAIL;
    }
    // SAFETY: Just mapped writable.
    unsafe { core::ptr::write_bytes(addr as *mut u8, 0, pages * PAGE_SIZE) };
    addr as i64
}

fn sys_munmap(addr: u64, length: u64) -> i64 {
    use crate::mm::{paging, phys, VirtualAddress, PAGE_SIZE};

    if length == 0 || addr % PAGE_SIZE as u64 != 0 {
        return EFAIL;
    }
    let pages = length.div_ceil(PAGE_SIZE as u64);
    for i in 0..pages {
        let va = VirtualAddress::new(addr + i * PAGE_SIZE as u64);
        if let Some(pa) = paging::virt_to_phys(va) {
            let _ = paging::unmap_page(va);
            phys::free_frame(pa.frame_base());
        }
    }
    0
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        // These constants are ABI; a change here breaks every shipped
        // userland binary.
        assert_eq!(nr::EXIT, 0);
        assert_eq!(nr::WRITE, 3);
        assert_eq!(nr::GETPID, 8);
        assert_eq!(nr::SLEEP, 10);
        assert_eq!(nr::YIELD, 11);
        assert_eq!(nr::MALLOC, 12);
        assert_eq!(nr::FREE, 13);
        assert_eq!(nr::KILL, 15);
        assert_eq!(nr::INPUT, 28);
        assert_eq!(nr::SSTATS, 29);
        assert_eq!(nr::GETUID, 33);
        assert_eq!(nr::SETUID, 34);
        assert_eq!(nr::SSTATS2, 38);
        assert_eq!(nr::MMAP, 39);
        assert_eq!(nr::MUNMAP, 40);
        assert_eq!(SYSCALL_COUNT, 41);
    }

    #[test]
    fn unknown_syscalls_fail_generically() {
        assert_eq!(syscall_handler(999, 0, 0, 0, 0), -1);
    }

    #[test]
    fn unregistered_external_syscall_fails() {
        // CLOSE never gets a handler installed by any test.
        assert_eq!(syscall_handler(nr::CLOSE, 0, 0, 0, 0), -1);
    }

    #[test]
    fn external_registration_routes_calls() {
        fn fake_open(a1: u64, _: u64, _: u64, _: u64) -> i64 {
            a1 as i64 + 100
        }
        register_external(nr::OPEN, fake_open);
        assert_eq!(syscall_handler(nr::OPEN, 5, 0, 0, 0), 105);
        // Leave the table clean for other tests.
        EXTERNAL.lock()[nr::OPEN as usize] = None;
    }

    #[test]
    fn fork_is_stable_failure() {
        assert_eq!(syscall_handler(nr::FORK, 0, 0, 0, 0), -1);
    }
}
