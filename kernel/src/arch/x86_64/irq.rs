//! 8259 PIC management and IRQ dispatch
//!
//! Hardware interrupt vectors are remapped to 32..47. Drivers register a
//! plain handler function per IRQ line; the dispatcher invokes it with
//! interrupts off and sends EOI after the handler returns.

use spin::Mutex;

/// First vector of the remapped master PIC.
pub const PIC_1_OFFSET: u8 = 32;
/// First vector of the remapped slave PIC.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const IRQ_LINES: usize = 16;

type IrqHandler = fn();

static HANDLERS: Mutex<[Option<IrqHandler>; IRQ_LINES]> = Mutex::new([None; IRQ_LINES]);

#[cfg(target_os = "none")]
static PICS: Mutex<pic8259::ChainedPics> =
    // SAFETY: 32/40 are outside the CPU exception range.
    Mutex::new(unsafe { pic8259::ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the PICs and mask every line except the cascade.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: Standard 8259 initialization sequence at the legacy ports.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Everything starts masked; lines open as handlers are installed.
        pics.write_masks(0xFB, 0xFF); // IRQ2 (cascade) stays enabled
    }
    log::info!("PIC remapped to vectors {}..{}", PIC_1_OFFSET, PIC_2_OFFSET + 8);
}

/// Register a handler and unmask its line.
pub fn install_handler(irq: u8, handler: IrqHandler) {
    if irq as usize >= IRQ_LINES {
        return;
    }
    HANDLERS.lock()[irq as usize] = Some(handler);
    unmask(irq);
    log::info!("IRQ {} handler installed", irq);
}

/// Remove a handler and mask its line again.
pub fn uninstall_handler(irq: u8) {
    if irq as usize >= IRQ_LINES {
        return;
    }
    HANDLERS.lock()[irq as usize] = None;
    mask(irq);
}

#[cfg(target_os = "none")]
fn unmask(irq: u8) {
    // SAFETY: Read-modify-write of the PIC mask registers under the lock.
    unsafe {
        let mut pics = PICS.lock();
        let masks = pics.read_masks();
        let (mut m1, mut m2) = (masks[0], masks[1]);
        if irq < 8 {
            m1 &= !(1 << irq);
        } else {
            m2 &= !(1 << (irq - 8));
            m1 &= !(1 << 2); // cascade
        }
        pics.write_masks(m1, m2);
    }
}

#[cfg(target_os = "none")]
fn mask(irq: u8) {
    // SAFETY: Read-modify-write of the PIC mask registers under the lock.
    unsafe {
        let mut pics = PICS.lock();
        let masks = pics.read_masks();
        let (mut m1, mut m2) = (masks[0], masks[1]);
        if irq < 8 {
            m1 |= 1 << irq;
        } else {
            m2 |= 1 << (irq - 8);
        }
        pics.write_masks(m1, m2);
    }
}

#[cfg(not(target_os = "none"))]
fn unmask(_irq: u8) {}

#[cfg(not(target_os = "none"))]
fn mask(_irq: u8) {}

/// Run the handler for `irq` (if any) and acknowledge the interrupt.
///
/// Runs in interrupt context with interrupts off; registered handlers must
/// not re-enable them and must not sleep.
pub fn dispatch(irq: u8) {
    let handler = {
        let table = HANDLERS.lock();
        table.get(irq as usize).copied().flatten()
    };
    if let Some(h) = handler {
        h();
    }
    end_of_interrupt(irq);
}

/// Send EOI for the given line.
#[cfg(target_os = "none")]
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: Notifies the PIC that the in-service interrupt is handled.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}

#[cfg(not(target_os = "none"))]
pub fn end_of_interrupt(_irq: u8) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bump() {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn dispatch_runs_registered_handler_once() {
        FIRED.store(0, Ordering::SeqCst);
        install_handler(11, bump);
        dispatch(11);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        uninstall_handler(11);
        dispatch(11);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_range_lines_are_ignored() {
        install_handler(200, bump);
        dispatch(200);
    }
}
