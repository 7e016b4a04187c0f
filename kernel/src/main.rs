//! ModuOS kernel entry point
//!
//! The boot shim (32-bit Multiboot2 stub that builds the initial identity
//! map and switches to long mode) jumps here with the GRUB magic and the
//! boot-information address. Bring-up order: serial console and logger,
//! CPU tables and interrupt plumbing, memory system, process manager and
//! scheduler, timer, USB. The boot flow then becomes the idle process.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use moduos_kernel::{
    arch, drivers, klog, mm, multiboot, process, sched, serial,
};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial::emergency_write(format_args!("\nKERNEL PANIC: {}\n", info));
    loop {
        arch::halt();
    }
}

/// Rust-side Multiboot2 entry, called from the long-mode boot shim with
/// the magic in edi and the info pointer in esi.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn multiboot_main(magic: u32, info_addr: u32) -> ! {
    serial::init();
    klog::init(log::LevelFilter::Info);

    if magic != multiboot::MULTIBOOT2_BOOTLOADER_MAGIC {
        panic!("invalid multiboot magic {:#x}", magic);
    }

    kernel_main(info_addr as u64)
}

#[cfg(target_os = "none")]
fn kernel_main(info_addr: u64) -> ! {
    log::info!("ModuOS kernel starting");

    arch::x86_64::init();

    // SAFETY: GRUB's info block is identity mapped at boot.
    let boot_info = unsafe { multiboot::parse(info_addr) };
    log::info!(
        "{} usable regions, {} MiB total",
        boot_info.region_count,
        boot_info.total_mem / (1024 * 1024)
    );

    mm::init(boot_info.total_mem, boot_info.usable_regions());

    // Keep the linear framebuffer out of the allocator's hands; the
    // graphics collaborator maps it through ioremap_guarded.
    if let Some(fb) = boot_info.framebuffer {
        log::info!(
            "framebuffer {}x{} bpp {} at {:#x}",
            fb.width,
            fb.height,
            fb.bpp,
            fb.phys_addr
        );
        arch::without_interrupts(|| {
            mm::phys::FRAME_ALLOCATOR
                .lock()
                .reserve_range(mm::PhysicalAddress::new(fb.phys_addr), fb.size_bytes());
        });
    }

    process::init();
    sched::init();
    arch::x86_64::timer::init(arch::x86_64::timer::TICK_HZ);

    drivers::usb::hid::init();
    drivers::usb::init();

    arch::enable_interrupts();
    log::info!("kernel initialized, entering idle loop");

    // The boot flow is the idle process (PID 0): offer the CPU, then halt
    // until the next interrupt.
    loop {
        sched::schedule();
        arch::halt();
    }
}

/// Host builds have nothing to run; tests live in the library.
#[cfg(not(target_os = "none"))]
fn main() {}
