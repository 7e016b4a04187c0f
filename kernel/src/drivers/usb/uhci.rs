//! UHCI host controller (USB 1.1, I/O-port register file)
//!
//! Schedule layout: a 1024-entry frame list in DMA memory, every entry
//! pointing at the interrupt queue head, which links to the control queue
//! head, which links to the bulk queue head. Transfer descriptors are
//! heap-allocated, published with their physical addresses and harvested
//! by the IRQ handler once the hardware clears their ACTIVE bit.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use super::{
    transfer::TransferPtr, HostController, SetupPacket, TransferStatus, UsbDevice, UsbError,
    UsbSpeed, USB_DIR_IN, USB_PID_IN, USB_PID_OUT, USB_PID_SETUP,
};
use crate::drivers::pci::{self, PciDevice};
use crate::mm::dma::{self, DmaBuffer};
use crate::mm::kheap;

// Register offsets (I/O space)
const REG_USBCMD: u16 = 0x00;
const REG_USBSTS: u16 = 0x02;
const REG_USBINTR: u16 = 0x04;
const REG_FRNUM: u16 = 0x06;
const REG_FRBASEADD: u16 = 0x08;
const REG_PORTSC1: u16 = 0x10;
const REG_PORTSC2: u16 = 0x12;

// USBCMD bits
const CMD_RS: u16 = 1 << 0;
const CMD_HCRESET: u16 = 1 << 1;
const CMD_CF: u16 = 1 << 6;
const CMD_MAXP: u16 = 1 << 7;

// USBSTS bits
const STS_USBINT: u16 = 1 << 0;
const STS_ERROR: u16 = 1 << 1;
const STS_HCH: u16 = 1 << 5;

// USBINTR bits
const INTR_TIMEOUT: u16 = 1 << 0;
const INTR_RESUME: u16 = 1 << 1;
const INTR_IOC: u16 = 1 << 2;
const INTR_SP: u16 = 1 << 3;

// PORTSC bits
const PORT_CCS: u16 = 1 << 0;
const PORT_PED: u16 = 1 << 2;
const PORT_LSDA: u16 = 1 << 8;
const PORT_PR: u16 = 1 << 9;

// Link pointer bits
const LINK_TERMINATE: u32 = 1 << 0;
const LINK_QH: u32 = 1 << 1;

// TD status bits
const TD_STATUS_ACTLEN_MASK: u32 = 0x7FF;
const TD_STATUS_BITSTUFF: u32 = 1 << 17;
const TD_STATUS_CRC: u32 = 1 << 18;
const TD_STATUS_NAK: u32 = 1 << 19;
const TD_STATUS_BABBLE: u32 = 1 << 20;
const TD_STATUS_DBUFFER: u32 = 1 << 21;
const TD_STATUS_STALLED: u32 = 1 << 22;
const TD_STATUS_ACTIVE: u32 = 1 << 23;
const TD_STATUS_IOC: u32 = 1 << 24;
const TD_STATUS_LS: u32 = 1 << 26;
const TD_STATUS_CERR_3: u32 = 3 << 27;

const FRAMELIST_COUNT: usize = 1024;

/// Transfer descriptor, walked by hardware. 16-byte aligned; every pointer
/// field holds a physical address.
#[repr(C, align(16))]
struct Td {
    link: u32,
    status: u32,
    token: u32,
    buffer: u32,
    // Software-only area (hardware reads the first 16 bytes).
    _sw: [u32; 4],
}

/// Queue head: horizontal link to the next QH, vertical link to the first
/// TD of the element chain.
#[repr(C, align(16))]
struct Qh {
    head_link: u32,
    element_link: u32,
    _sw: [u32; 6],
}

/// TD token: maxlen[31:21] toggle[19] endpoint[18:15] address[14:8] pid[7:0].
fn td_token(len: u16, address: u8, endpoint: u8, toggle: bool, pid: u8) -> u32 {
    let maxlen: u32 = if len == 0 { 0x7FF } else { u32::from(len) - 1 };
    (maxlen << 21)
        | (u32::from(toggle) << 19)
        | (u32::from(endpoint & 0x0F) << 15)
        | (u32::from(address & 0x7F) << 8)
        | u32::from(pid)
}

/// Bytes actually moved, from the TD status field.
fn td_actual_len(status: u32) -> u16 {
    let raw = (status & TD_STATUS_ACTLEN_MASK).wrapping_add(1) & 0x7FF;
    raw as u16
}

fn td_error_status(status: u32) -> Option<TransferStatus> {
    if status & TD_STATUS_STALLED != 0 {
        Some(TransferStatus::Stalled)
    } else if status & (TD_STATUS_BABBLE | TD_STATUS_CRC | TD_STATUS_BITSTUFF | TD_STATUS_DBUFFER)
        != 0
    {
        Some(TransferStatus::Error)
    } else {
        None
    }
}

/// Tracker pairing a submitted transfer with its descriptor chain.
struct Tracker {
    transfer: TransferPtr,
    tds: Vec<(*mut Td, u32)>,
}

pub struct UhciController {
    pci: PciDevice,
    iobase: u16,
    frame_list: Option<DmaBuffer>,
    interrupt_qh: *mut Qh,
    control_qh: *mut Qh,
    bulk_qh: *mut Qh,
    trackers: Vec<Tracker>,
}

// SAFETY: All descriptor pointers are owned by this controller and touched
// only under the USB core lock with interrupts disabled.
unsafe impl Send for UhciController {}

/// Probe a UHCI function found on PCI. Ring setup happens in `init`.
pub fn probe(pci_dev: PciDevice) -> Option<Box<UhciController>> {
    pci::enable_bus_mastering(&pci_dev);
    pci::enable_io_space(&pci_dev);

    let bar4 = pci::read_bar(&pci_dev, 4);
    if bar4 & pci::PCI_BAR_IO == 0 {
        log::error!("UHCI: BAR4 is not I/O space");
        return None;
    }
    let iobase = (bar4 & 0xFFFE) as u16;

    Some(Box::new(UhciController {
        pci: pci_dev,
        iobase,
        frame_list: None,
        interrupt_qh: core::ptr::null_mut(),
        control_qh: core::ptr::null_mut(),
        bulk_qh: core::ptr::null_mut(),
        trackers: Vec::new(),
    }))
}

impl UhciController {
    #[cfg(target_os = "none")]
    fn read16(&self, reg: u16) -> u16 {
        use x86_64::instructions::port::Port;
        // SAFETY: The register lies inside the controller's I/O BAR.
        unsafe { Port::<u16>::new(self.iobase + reg).read() }
    }

    #[cfg(target_os = "none")]
    fn write16(&self, reg: u16, value: u16) {
        use x86_64::instructions::port::Port;
        // SAFETY: As in read16.
        unsafe { Port::<u16>::new(self.iobase + reg).write(value) }
    }

    #[cfg(target_os = "none")]
    fn write32(&self, reg: u16, value: u32) {
        use x86_64::instructions::port::Port;
        // SAFETY: As in read16.
        unsafe { Port::<u32>::new(self.iobase + reg).write(value) }
    }

    #[cfg(not(target_os = "none"))]
    fn read16(&self, _reg: u16) -> u16 {
        0
    }

    #[cfg(not(target_os = "none"))]
    fn write16(&self, _reg: u16, _value: u16) {}

    #[cfg(not(target_os = "none"))]
    fn write32(&self, _reg: u16, _value: u32) {}

    fn alloc_td(&self) -> Option<(*mut Td, u32)> {
        let td = kheap::kmalloc(core::mem::size_of::<Td>()) as *mut Td;
        if td.is_null() {
            return None;
        }
        // SAFETY: Fresh allocation of Td size.
        unsafe {
            (*td).link = LINK_TERMINATE;
            (*td).status = TD_STATUS_ACTIVE;
            (*td).token = 0;
            (*td).buffer = 0;
            (*td)._sw = [0; 4];
        }
        let phys = super::virt_to_phys_dma(td as u64)? as u32;
        Some((td, phys))
    }

    fn alloc_qh(&self) -> Option<(*mut Qh, u32)> {
        let qh = kheap::kmalloc(core::mem::size_of::<Qh>()) as *mut Qh;
        if qh.is_null() {
            return None;
        }
        // SAFETY: Fresh allocation of Qh size.
        unsafe {
            (*qh).head_link = LINK_TERMINATE;
            (*qh).element_link = LINK_TERMINATE;
            (*qh)._sw = [0; 6];
        }
        let phys = super::virt_to_phys_dma(qh as u64)? as u32;
        Some((qh, phys))
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        log::info!("UHCI: resetting controller");

        self.write16(REG_USBCMD, 0);
        let mut timeout = 1000;
        while timeout > 0 && self.read16(REG_USBSTS) & STS_HCH == 0 {
            super::delay_ms(1);
            timeout -= 1;
        }
        if timeout == 0 {
            log::error!("UHCI: failed to halt");
            return Err(UsbError::HardwareFault);
        }

        self.write16(REG_USBCMD, CMD_HCRESET);
        timeout = 1000;
        while timeout > 0 && self.read16(REG_USBCMD) & CMD_HCRESET != 0 {
            super::delay_ms(1);
            timeout -= 1;
        }
        if timeout == 0 {
            log::error!("UHCI: reset timeout");
            return Err(UsbError::HardwareFault);
        }

        self.write16(REG_USBSTS, 0xFFFF);
        Ok(())
    }

    fn setup_schedule(&mut self) -> Result<(), UsbError> {
        let (int_qh, int_phys) = self.alloc_qh().ok_or(UsbError::NoMemory)?;
        let (ctrl_qh, ctrl_phys) = self.alloc_qh().ok_or(UsbError::NoMemory)?;
        let (bulk_qh, _bulk_phys) = self.alloc_qh().ok_or(UsbError::NoMemory)?;

        // Schedule order: interrupt -> control -> bulk.
        // SAFETY: All three QHs are live heap allocations.
        unsafe {
            (*int_qh).head_link = ctrl_phys | LINK_QH;
            (*ctrl_qh).head_link = _bulk_phys | LINK_QH;
            (*bulk_qh).head_link = LINK_TERMINATE;
        }
        self.interrupt_qh = int_qh;
        self.control_qh = ctrl_qh;
        self.bulk_qh = bulk_qh;

        let frame_list =
            dma::dma_alloc(FRAMELIST_COUNT * 4, 4096).map_err(|_| UsbError::NoMemory)?;
        let entries = frame_list.virt as *mut u32;
        for i in 0..FRAMELIST_COUNT {
            // SAFETY: The DMA buffer covers FRAMELIST_COUNT u32 entries.
            unsafe { *entries.add(i) = int_phys | LINK_QH };
        }
        fence(Ordering::SeqCst);

        self.write32(REG_FRBASEADD, frame_list.phys.as_u64() as u32);
        self.write16(REG_FRNUM, 0);
        self.frame_list = Some(frame_list);

        log::info!("UHCI: frame list and queues initialized");
        Ok(())
    }

    fn start(&mut self) -> Result<(), UsbError> {
        self.write16(REG_USBINTR, INTR_IOC | INTR_TIMEOUT | INTR_RESUME | INTR_SP);
        self.write16(REG_USBCMD, CMD_RS | CMD_CF | CMD_MAXP);

        super::delay_ms(5);
        if self.read16(REG_USBSTS) & STS_HCH != 0 {
            log::error!("UHCI: failed to start");
            return Err(UsbError::HardwareFault);
        }
        log::info!("UHCI: controller started");
        Ok(())
    }

    /// Re-link the interrupt QH's element chain from the surviving
    /// trackers (each interrupt transfer is a single TD).
    fn rebuild_interrupt_chain(&mut self) {
        let mut prev: Option<*mut Td> = None;
        let mut first_phys: u32 = LINK_TERMINATE;

        for tr in &self.trackers {
            let (td, phys) = tr.tds[0];
            if let Some(p) = prev {
                // SAFETY: Tracker TDs are live until the tracker is freed.
                unsafe { (*p).link = phys };
            } else {
                first_phys = phys;
            }
            // SAFETY: As above.
            unsafe { (*td).link = LINK_TERMINATE };
            prev = Some(td);
        }

        fence(Ordering::SeqCst);
        // SAFETY: interrupt_qh lives for the controller's lifetime.
        unsafe { (*self.interrupt_qh).element_link = first_phys };
        fence(Ordering::SeqCst);
    }

    fn free_tracker_tds(tds: &[(*mut Td, u32)]) {
        for (td, _) in tds {
            kheap::kfree(*td as *mut u8);
        }
    }
}

impl HostController for UhciController {
    fn name(&self) -> &'static str {
        "UHCI"
    }

    fn num_ports(&self) -> u8 {
        2
    }

    fn irq_line(&self) -> u8 {
        self.pci.interrupt_line
    }

    fn init(&mut self) -> Result<(), UsbError> {
        self.reset()?;
        self.setup_schedule()?;
        self.start()
    }

    fn shutdown(&mut self) {
        self.write16(REG_USBINTR, 0);
        self.write16(REG_USBCMD, 0);

        for tr in core::mem::take(&mut self.trackers) {
            // SAFETY: Schedules are stopped; the hardware no longer walks
            // these descriptors.
            unsafe {
                tr.transfer.as_mut().finish(TransferStatus::Error, 0);
            }
            Self::free_tracker_tds(&tr.tds);
        }
        for qh in [self.interrupt_qh, self.control_qh, self.bulk_qh] {
            if !qh.is_null() {
                kheap::kfree(qh as *mut u8);
            }
        }
        if let Some(mut fl) = self.frame_list.take() {
            dma::dma_free(&mut fl);
        }
    }

    fn reset_port(&mut self, port: u8) -> Option<UsbSpeed> {
        if port >= 2 {
            return None;
        }
        let reg = if port == 0 { REG_PORTSC1 } else { REG_PORTSC2 };

        if self.read16(reg) & PORT_CCS == 0 {
            return None;
        }
        log::info!("UHCI: device on port {}", port);

        self.write16(reg, PORT_PR);
        super::delay_ms(50);
        self.write16(reg, 0);
        super::delay_ms(10);

        let status = self.read16(reg);
        self.write16(reg, status | PORT_PED);
        super::delay_ms(10);

        let status = self.read16(reg);
        if status & PORT_CCS == 0 {
            return None;
        }
        Some(if status & PORT_LSDA != 0 { UsbSpeed::Low } else { UsbSpeed::Full })
    }

    /// Control transfer: SETUP TD, max-packet-sized DATA TDs with
    /// alternating toggle, STATUS TD in the opposite direction, all hung
    /// off the control QH and polled to completion.
    fn control_transfer(
        &mut self,
        dev: &UsbDevice,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Result<(), UsbError> {
        let low_speed = dev.speed == UsbSpeed::Low;
        let ls_bit = if low_speed { TD_STATUS_LS } else { 0 };
        let mps = dev.max_packet_size.max(8);

        let mut tds: Vec<(*mut Td, u32)> = Vec::new();
        let fail = |tds: &Vec<(*mut Td, u32)>| {
            Self::free_tracker_tds(tds);
            Err(UsbError::NoMemory)
        };

        // SETUP stage, always DATA0.
        let setup_phys =
            super::virt_to_phys_dma(setup as *const SetupPacket as u64).ok_or(UsbError::NoMemory)?;
        let Some((setup_td, setup_td_phys)) = self.alloc_td() else {
            return fail(&tds);
        };
        // SAFETY: setup_td is a live TD.
        unsafe {
            (*setup_td).token = td_token(8, dev.address, 0, false, USB_PID_SETUP);
            (*setup_td).buffer = setup_phys as u32;
            (*setup_td).status = TD_STATUS_ACTIVE | TD_STATUS_CERR_3 | ls_bit;
        }
        tds.push((setup_td, setup_td_phys));

        // DATA stage in max-packet chunks, toggle starting at DATA1.
        let total = setup.length;
        if total > 0 && !data.is_null() {
            let data_pid = if setup.request_type & USB_DIR_IN != 0 { USB_PID_IN } else { USB_PID_OUT };
            let mut offset: u16 = 0;
            let mut toggle = true;
            while offset < total {
                let chunk = (total - offset).min(mps);
                let Some(chunk_phys) = super::virt_to_phys_dma(data as u64 + offset as u64) else {
                    return fail(&tds);
                };
                let Some((td, td_phys)) = self.alloc_td() else {
                    return fail(&tds);
                };
                // SAFETY: td is a live TD.
                unsafe {
                    (*td).token = td_token(chunk, dev.address, 0, toggle, data_pid);
                    (*td).buffer = chunk_phys as u32;
                    (*td).status = TD_STATUS_ACTIVE | TD_STATUS_CERR_3 | ls_bit;
                }
                tds.push((td, td_phys));
                offset += chunk;
                toggle = !toggle;
            }
        }

        // STATUS stage: zero-length, opposite direction, DATA1.
        let status_pid = if total > 0 {
            if setup.request_type & USB_DIR_IN != 0 { USB_PID_OUT } else { USB_PID_IN }
        } else {
            USB_PID_IN
        };
        let Some((status_td, status_td_phys)) = self.alloc_td() else {
            return fail(&tds);
        };
        // SAFETY: status_td is a live TD.
        unsafe {
            (*status_td).token = td_token(0, dev.address, 0, true, status_pid);
            (*status_td).status = TD_STATUS_ACTIVE | TD_STATUS_CERR_3 | TD_STATUS_IOC | ls_bit;
        }
        tds.push((status_td, status_td_phys));

        // Link the chain and publish it on the control QH.
        for w in 0..tds.len() - 1 {
            // SAFETY: Both TDs are live.
            unsafe { (*tds[w].0).link = tds[w + 1].1 };
        }
        fence(Ordering::SeqCst);
        // SAFETY: control_qh lives for the controller's lifetime.
        unsafe { (*self.control_qh).element_link = tds[0].1 };
        fence(Ordering::SeqCst);

        // Poll for completion, bounded.
        let mut timeout = 1000;
        let done = loop {
            fence(Ordering::SeqCst);
            // SAFETY: TDs stay live until freed below.
            let all_done =
                tds.iter().all(|(td, _)| unsafe { (**td).status } & TD_STATUS_ACTIVE == 0);
            if all_done {
                break true;
            }
            if timeout == 0 {
                break false;
            }
            timeout -= 1;
            super::delay_ms(1);
        };

        // Take the chain off the schedule before freeing anything.
        // SAFETY: control_qh is live.
        unsafe { (*self.control_qh).element_link = LINK_TERMINATE };
        fence(Ordering::SeqCst);

        let mut result = Ok(());
        if !done {
            log::error!("UHCI: control transfer timeout");
            result = Err(UsbError::Timeout);
        } else {
            for (td, _) in &tds {
                // SAFETY: As above.
                let status = unsafe { (**td).status };
                if let Some(err) = td_error_status(status) {
                    result = Err(match err {
                        TransferStatus::Stalled => UsbError::Stalled,
                        _ => UsbError::TransferFailed,
                    });
                    break;
                }
                if status & TD_STATUS_NAK != 0 {
                    result = Err(UsbError::TransferFailed);
                    break;
                }
            }
        }

        Self::free_tracker_tds(&tds);
        result
    }

    fn submit_interrupt_transfer(
        &mut self,
        dev: &UsbDevice,
        transfer: TransferPtr,
    ) -> Result<(), UsbError> {
        // SAFETY: The transfer is live (just allocated by the core).
        let (endpoint, buffer, length) = unsafe {
            let t = transfer.as_ref();
            (t.endpoint, t.buffer, t.length)
        };

        let pid = if endpoint & 0x80 != 0 { USB_PID_IN } else { USB_PID_OUT };
        let buffer_phys = super::virt_to_phys_dma(buffer as u64).ok_or(UsbError::NoMemory)?;

        let (td, td_phys) = self.alloc_td().ok_or(UsbError::NoMemory)?;
        let ls_bit = if dev.speed == UsbSpeed::Low { TD_STATUS_LS } else { 0 };
        // SAFETY: td is a live TD.
        unsafe {
            (*td).token = td_token(length, dev.address, endpoint & 0x0F, true, pid);
            (*td).buffer = buffer_phys as u32;
            (*td).status = TD_STATUS_ACTIVE | TD_STATUS_IOC | TD_STATUS_CERR_3 | ls_bit;
        }

        self.trackers.push(Tracker { transfer, tds: alloc::vec![(td, td_phys)] });
        self.rebuild_interrupt_chain();
        Ok(())
    }

    fn cancel_transfer(&mut self, transfer: TransferPtr) -> Result<(), UsbError> {
        let Some(pos) = self.trackers.iter().position(|t| t.transfer == transfer) else {
            return Err(UsbError::TransferFailed);
        };
        let tracker = self.trackers.remove(pos);
        for (td, _) in &tracker.tds {
            // SAFETY: Tracker TDs are live until freed below.
            unsafe { (**td).status &= !TD_STATUS_ACTIVE };
        }
        self.rebuild_interrupt_chain();
        // SAFETY: The transfer is live; the submitter holds the pointer.
        unsafe { transfer.as_mut().finish(TransferStatus::Error, 0) };
        Self::free_tracker_tds(&tracker.tds);
        Ok(())
    }

    fn handle_irq(&mut self, completed: &mut Vec<TransferPtr>) -> bool {
        let status = self.read16(REG_USBSTS);
        if status == 0 {
            return false;
        }

        if status & (STS_USBINT | STS_ERROR) != 0 {
            if status & STS_ERROR != 0 {
                log::error!("UHCI: USB error interrupt");
            }
            fence(Ordering::SeqCst);

            let mut i = 0;
            while i < self.trackers.len() {
                // SAFETY: Tracker TDs are live.
                let td_status = unsafe { (*self.trackers[i].tds[0].0).status };
                if td_status & TD_STATUS_ACTIVE != 0 {
                    i += 1;
                    continue;
                }

                let tracker = self.trackers.remove(i);
                // SAFETY: The transfer is live until the core releases it
                // after the callback.
                unsafe {
                    let t = tracker.transfer.as_mut();
                    match td_error_status(td_status) {
                        Some(err) => {
                            t.finish(err, 0);
                        }
                        None => {
                            let len = td_actual_len(td_status);
                            t.finish(TransferStatus::Completed, len.min(t.length));
                        }
                    }
                }
                Self::free_tracker_tds(&tracker.tds);
                completed.push(tracker.transfer);
            }
            self.rebuild_interrupt_chain();
        }

        self.write16(REG_USBSTS, status);
        true
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn token_layout_is_bit_exact() {
        // 8-byte SETUP to address 5 endpoint 0, DATA0.
        let t = td_token(8, 5, 0, false, USB_PID_SETUP);
        assert_eq!(t & 0xFF, USB_PID_SETUP as u32);
        assert_eq!((t >> 8) & 0x7F, 5);
        assert_eq!((t >> 15) & 0x0F, 0);
        assert_eq!((t >> 19) & 1, 0);
        assert_eq!(t >> 21, 7); // maxlen = len - 1

        // Zero-length STATUS encodes maxlen 0x7FF.
        let t = td_token(0, 1, 0, true, USB_PID_IN);
        assert_eq!(t >> 21, 0x7FF);
        assert_eq!((t >> 19) & 1, 1);
    }

    #[test]
    fn actual_length_decoding() {
        // Hardware stores transferred-1; 0x7FF means zero bytes.
        assert_eq!(td_actual_len(7), 8);
        assert_eq!(td_actual_len(0x7FF), 0);
    }

    #[test]
    fn error_bits_map_to_terminal_states() {
        assert_eq!(td_error_status(TD_STATUS_STALLED), Some(TransferStatus::Stalled));
        assert_eq!(td_error_status(TD_STATUS_BABBLE), Some(TransferStatus::Error));
        assert_eq!(td_error_status(TD_STATUS_CRC), Some(TransferStatus::Error));
        assert_eq!(td_error_status(0), None);
    }

    #[test]
    fn descriptor_alignment_matches_hardware() {
        assert_eq!(core::mem::align_of::<Td>(), 16);
        assert_eq!(core::mem::align_of::<Qh>(), 16);
        assert!(core::mem::size_of::<Td>() >= 16);
    }
}
