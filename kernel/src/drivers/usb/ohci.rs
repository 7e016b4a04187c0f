//! OHCI host controller (USB 1.1, memory-mapped register file)
//!
//! The hardware communicates through the HCCA block (256-byte aligned): a
//! 32-entry interrupt table feeds periodic endpoints, and completed TDs
//! are posted to the HCCA done head. Control and bulk endpoint lists hang
//! off dedicated registers. TDs come from a fixed pool so done-head
//! physical addresses can be mapped back to trackers by offset.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use super::{
    transfer::TransferPtr, HostController, SetupPacket, TransferStatus, UsbDevice, UsbError,
    UsbSpeed, USB_DIR_IN, USB_PID_IN, USB_PID_OUT, USB_PID_SETUP,
};
use crate::drivers::pci::{self, PciDevice};
use crate::mm::kheap;
use crate::mm::paging;

// Register offsets (MMIO)
const REG_CONTROL: u32 = 0x04;
const REG_COMMAND_STATUS: u32 = 0x08;
const REG_INTERRUPT_STATUS: u32 = 0x0C;
const REG_INTERRUPT_ENABLE: u32 = 0x10;
const REG_INTERRUPT_DISABLE: u32 = 0x14;
const REG_HCCA: u32 = 0x18;
const REG_CONTROL_HEAD_ED: u32 = 0x20;
const REG_BULK_HEAD_ED: u32 = 0x28;
const REG_FM_INTERVAL: u32 = 0x34;
const REG_PERIODIC_START: u32 = 0x40;
const REG_RH_DESCRIPTOR_A: u32 = 0x48;
const REG_RH_STATUS: u32 = 0x50;
const REG_RH_PORT_STATUS: u32 = 0x54;

// HcControl bits
const CTRL_PLE: u32 = 1 << 2;
const CTRL_CLE: u32 = 1 << 4;
const CTRL_BLE: u32 = 1 << 5;
const CTRL_HCFS_MASK: u32 = 3 << 6;
const CTRL_HCFS_OPERATIONAL: u32 = 2 << 6;
const CTRL_HCFS_SUSPEND: u32 = 3 << 6;
const CTRL_IR: u32 = 1 << 8;

// HcCommandStatus bits
const CMD_HCR: u32 = 1 << 0;
const CMD_CLF: u32 = 1 << 1;
const CMD_OCR: u32 = 1 << 3;

// Interrupt bits
const INT_SO: u32 = 1 << 0;
const INT_WDH: u32 = 1 << 1;
const INT_RD: u32 = 1 << 3;
const INT_UE: u32 = 1 << 4;
const INT_RHSC: u32 = 1 << 6;
const INT_MIE: u32 = 1 << 31;

// Root hub bits
const RH_LPSC: u32 = 1 << 16;
const PORT_CCS: u32 = 1 << 0;
const PORT_PES: u32 = 1 << 1;
const PORT_PRS: u32 = 1 << 4;
const PORT_LSDA: u32 = 1 << 9;
const PORT_PRSC: u32 = 1 << 20;

// ED control fields
const ED_FA_MASK: u32 = 0x7F;
const ED_EN_SHIFT: u32 = 7;
const ED_D_OUT: u32 = 1 << 11;
const ED_D_IN: u32 = 2 << 11;
const ED_S: u32 = 1 << 13;
const ED_K: u32 = 1 << 14;
const ED_MPS_SHIFT: u32 = 16;

// TD control fields
const TD_R: u32 = 1 << 18;
const TD_DP_SETUP: u32 = 0 << 19;
const TD_DP_OUT: u32 = 1 << 19;
const TD_DP_IN: u32 = 2 << 19;
const TD_T_SHIFT: u32 = 24;
const TD_CC_SHIFT: u32 = 28;
const TD_CC_NOERROR: u32 = 0;
const TD_CC_STALL: u32 = 4;
const TD_CC_NOT_ACCESSED: u32 = 15;

const TD_POOL_COUNT: usize = 64;

/// Host Controller Communications Area, 256-byte aligned.
#[repr(C, align(256))]
struct Hcca {
    interrupt_table: [u32; 32],
    frame_number: u16,
    _pad: u16,
    done_head: u32,
    _reserved: [u8; 116],
}

/// Endpoint descriptor (16-byte aligned).
#[repr(C, align(16))]
struct Ed {
    control: u32,
    tail: u32,
    head: u32,
    next: u32,
    _sw: [u32; 4],
}

/// Transfer descriptor (16-byte aligned).
#[repr(C, align(16))]
struct Td {
    control: u32,
    current_buffer: u32,
    next: u32,
    buffer_end: u32,
    _sw: [u32; 4],
}

/// Completion code -> transfer status; `None` while not accessed.
fn cc_to_status(cc: u32) -> Option<TransferStatus> {
    match cc {
        TD_CC_NOERROR => Some(TransferStatus::Completed),
        TD_CC_NOT_ACCESSED => None,
        TD_CC_STALL => Some(TransferStatus::Stalled),
        _ => Some(TransferStatus::Error),
    }
}

fn ed_control(address: u8, endpoint: u8, speed: UsbSpeed, max_packet: u16, direction: u32) -> u32 {
    let mut c = (u32::from(address) & ED_FA_MASK)
        | ((u32::from(endpoint) & 0x0F) << ED_EN_SHIFT)
        | ((u32::from(max_packet) & 0x7FF) << ED_MPS_SHIFT)
        | direction;
    if speed == UsbSpeed::Low {
        c |= ED_S;
    }
    c
}

fn td_control(pid: u8, toggle: u32, rounding: bool) -> u32 {
    let dp = match pid {
        USB_PID_SETUP => TD_DP_SETUP,
        USB_PID_IN => TD_DP_IN,
        _ => TD_DP_OUT,
    };
    let mut c = dp | ((toggle & 3) << TD_T_SHIFT) | (TD_CC_NOT_ACCESSED << TD_CC_SHIFT);
    if rounding {
        c |= TD_R;
    }
    c
}

struct Tracker {
    transfer: TransferPtr,
    td: *mut Td,
    td_phys: u32,
    ed: *mut Ed,
}

pub struct OhciController {
    pci: PciDevice,
    mmio: *mut u32,
    hcca: *mut Hcca,
    hcca_phys: u32,
    td_pool: *mut Td,
    td_pool_phys: u64,
    control_head: *mut Ed,
    bulk_head: *mut Ed,
    /// Head of the chain shared by all 32 interrupt-table slots.
    interrupt_head: Option<(*mut Ed, u32)>,
    trackers: Vec<Tracker>,
    num_ports: u8,
}

// SAFETY: Descriptor memory is owned by the controller and only touched
// under the USB core lock with interrupts disabled.
unsafe impl Send for OhciController {}

/// Probe an OHCI function: map its MMIO BAR and hand back a controller
/// whose rings are built in `init`.
pub fn probe(pci_dev: PciDevice) -> Option<Box<OhciController>> {
    let bar0 = pci::read_config(pci_dev.bus, pci_dev.device, pci_dev.function, 0x10);
    let mmio_phys = (bar0 & 0xFFFF_FFF0) as u64;

    log::info!("OHCI: mapping MMIO at {:#x}", mmio_phys);
    let mmio = paging::ioremap(mmio_phys, 4096)?;

    pci::enable_bus_mastering(&pci_dev);
    pci::enable_memory_space(&pci_dev);

    Some(Box::new(OhciController {
        pci: pci_dev,
        mmio: mmio.as_mut_ptr::<u32>(),
        hcca: core::ptr::null_mut(),
        hcca_phys: 0,
        td_pool: core::ptr::null_mut(),
        td_pool_phys: 0,
        control_head: core::ptr::null_mut(),
        bulk_head: core::ptr::null_mut(),
        interrupt_head: None,
        trackers: Vec::new(),
        num_ports: 0,
    }))
}

impl OhciController {
    fn read32(&self, reg: u32) -> u32 {
        // SAFETY: `reg` is a defined register offset inside the mapped BAR.
        unsafe { core::ptr::read_volatile(self.mmio.add(reg as usize / 4)) }
    }

    fn write32(&self, reg: u32, value: u32) {
        // SAFETY: As in read32.
        unsafe { core::ptr::write_volatile(self.mmio.add(reg as usize / 4), value) }
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        log::info!("OHCI: resetting");

        if self.read32(REG_CONTROL) & CTRL_IR != 0 {
            log::info!("OHCI: taking ownership from BIOS");
            self.write32(REG_COMMAND_STATUS, CMD_OCR);
            let mut timeout = 1000;
            while timeout > 0 && self.read32(REG_CONTROL) & CTRL_IR != 0 {
                super::delay_ms(1);
                timeout -= 1;
            }
            if timeout == 0 {
                log::error!("OHCI: failed to take ownership");
                return Err(UsbError::HardwareFault);
            }
        }

        self.write32(REG_COMMAND_STATUS, CMD_HCR);
        let mut timeout = 100;
        while timeout > 0 && self.read32(REG_COMMAND_STATUS) & CMD_HCR != 0 {
            super::delay_ms(1);
            timeout -= 1;
        }
        if timeout == 0 {
            log::error!("OHCI: reset timeout");
            return Err(UsbError::HardwareFault);
        }
        Ok(())
    }

    fn alloc_ed(
        &self,
        address: u8,
        endpoint: u8,
        speed: UsbSpeed,
        max_packet: u16,
        direction: u32,
    ) -> Option<(*mut Ed, u32)> {
        let ed = kheap::kmalloc(core::mem::size_of::<Ed>()) as *mut Ed;
        if ed.is_null() {
            return None;
        }
        // SAFETY: Fresh allocation of Ed size.
        unsafe {
            (*ed).control = ed_control(address, endpoint, speed, max_packet, direction);
            (*ed).tail = 0;
            (*ed).head = 0;
            (*ed).next = 0;
            (*ed)._sw = [0; 4];
        }
        let phys = super::virt_to_phys_dma(ed as u64)? as u32;
        Some((ed, phys))
    }

    /// Take a free TD from the pool (control word 0 marks free).
    fn alloc_pool_td(&mut self) -> Option<(*mut Td, u32)> {
        for i in 0..TD_POOL_COUNT {
            // SAFETY: The pool is a live allocation of TD_POOL_COUNT TDs.
            unsafe {
                let td = self.td_pool.add(i);
                if (*td).control == 0 {
                    (*td).control = TD_CC_NOT_ACCESSED << TD_CC_SHIFT;
                    let phys = (self.td_pool_phys + (i * core::mem::size_of::<Td>()) as u64) as u32;
                    return Some((td, phys));
                }
            }
        }
        None
    }

    fn free_pool_td(td: *mut Td) {
        // SAFETY: `td` points into the live pool.
        unsafe {
            (*td).control = 0;
            (*td).current_buffer = 0;
            (*td).next = 0;
            (*td).buffer_end = 0;
        }
    }

    /// Map a done-head physical address back into the pool.
    fn pool_td_from_phys(&self, phys: u32) -> Option<*mut Td> {
        let base = self.td_pool_phys;
        let offset = (phys as u64).checked_sub(base)?;
        let idx = (offset as usize) / core::mem::size_of::<Td>();
        if idx >= TD_POOL_COUNT {
            return None;
        }
        // SAFETY: Index-checked pool access.
        Some(unsafe { self.td_pool.add(idx) })
    }

    fn fill_td(td: *mut Td, control: u32, buffer: *mut u8, length: u16) -> Result<(), UsbError> {
        let (cur, end) = if length > 0 {
            let phys = super::virt_to_phys_dma(buffer as u64).ok_or(UsbError::NoMemory)?;
            (phys as u32, (phys + u64::from(length) - 1) as u32)
        } else {
            (0, 0)
        };
        // SAFETY: `td` is a live pool TD.
        unsafe {
            (*td).control = control;
            (*td).current_buffer = cur;
            (*td).buffer_end = end;
            (*td).next = 0;
        }
        Ok(())
    }

    fn setup_structures(&mut self) -> Result<(), UsbError> {
        let hcca = kheap::kmalloc_aligned(core::mem::size_of::<Hcca>(), 256) as *mut Hcca;
        if hcca.is_null() {
            return Err(UsbError::NoMemory);
        }
        // SAFETY: Fresh 256-byte-aligned allocation of Hcca size.
        unsafe { core::ptr::write_bytes(hcca as *mut u8, 0, core::mem::size_of::<Hcca>()) };
        self.hcca = hcca;
        self.hcca_phys =
            super::virt_to_phys_dma(hcca as u64).ok_or(UsbError::NoMemory)? as u32;

        let pool = kheap::kmalloc_aligned(core::mem::size_of::<Td>() * TD_POOL_COUNT, 16) as *mut Td;
        if pool.is_null() {
            return Err(UsbError::NoMemory);
        }
        // SAFETY: Fresh allocation of the whole pool.
        unsafe {
            core::ptr::write_bytes(pool as *mut u8, 0, core::mem::size_of::<Td>() * TD_POOL_COUNT)
        };
        self.td_pool = pool;
        self.td_pool_phys = super::virt_to_phys_dma(pool as u64).ok_or(UsbError::NoMemory)?;

        // Placeholder heads with the skip bit so the hardware ignores them.
        let (ctrl, ctrl_phys) =
            self.alloc_ed(0, 0, UsbSpeed::Full, 64, 0).ok_or(UsbError::NoMemory)?;
        let (bulk, bulk_phys) =
            self.alloc_ed(0, 0, UsbSpeed::Full, 64, 0).ok_or(UsbError::NoMemory)?;
        // SAFETY: Both EDs are live.
        unsafe {
            (*ctrl).control |= ED_K;
            (*bulk).control |= ED_K;
        }
        self.control_head = ctrl;
        self.bulk_head = bulk;

        fence(Ordering::SeqCst);

        self.write32(REG_HCCA, self.hcca_phys);
        self.write32(REG_CONTROL_HEAD_ED, ctrl_phys);
        self.write32(REG_BULK_HEAD_ED, bulk_phys);
        // Frame interval 11999 bit times + FSLargestDataPacket toggle.
        self.write32(REG_FM_INTERVAL, 0x2EDF | (1 << 31));
        self.write32(REG_PERIODIC_START, 0x2A2F);
        Ok(())
    }
}

impl HostController for OhciController {
    fn name(&self) -> &'static str {
        "OHCI"
    }

    fn num_ports(&self) -> u8 {
        self.num_ports
    }

    fn irq_line(&self) -> u8 {
        self.pci.interrupt_line
    }

    fn init(&mut self) -> Result<(), UsbError> {
        self.reset()?;
        self.setup_structures()?;

        self.write32(
            REG_INTERRUPT_ENABLE,
            INT_MIE | INT_WDH | INT_RHSC | INT_UE | INT_RD | INT_SO,
        );
        self.write32(REG_CONTROL, CTRL_HCFS_OPERATIONAL | CTRL_CLE | CTRL_BLE | CTRL_PLE);

        self.num_ports = (self.read32(REG_RH_DESCRIPTOR_A) & 0xFF) as u8;

        // Power the root hub and give ports time to come up.
        self.write32(REG_RH_STATUS, RH_LPSC);
        super::delay_ms(20);

        log::info!("OHCI: operational with {} ports", self.num_ports);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.write32(REG_INTERRUPT_DISABLE, INT_MIE);
        let control = (self.read32(REG_CONTROL) & !CTRL_HCFS_MASK) | CTRL_HCFS_SUSPEND;
        self.write32(REG_CONTROL, control);

        let mut freed_eds: Vec<*mut Ed> = Vec::new();
        for tr in core::mem::take(&mut self.trackers) {
            // SAFETY: Controller suspended; descriptors are quiescent.
            unsafe {
                tr.transfer.as_mut().finish(TransferStatus::Error, 0);
            }
            Self::free_pool_td(tr.td);
            if !freed_eds.contains(&tr.ed) {
                freed_eds.push(tr.ed);
                kheap::kfree(tr.ed as *mut u8);
            }
        }
        for ed in [self.control_head, self.bulk_head] {
            if !ed.is_null() {
                kheap::kfree(ed as *mut u8);
            }
        }
        if let Some((ed, _)) = self.interrupt_head.take() {
            if !freed_eds.contains(&ed) {
                kheap::kfree(ed as *mut u8);
            }
        }
        if !self.td_pool.is_null() {
            kheap::kfree(self.td_pool as *mut u8);
        }
        if !self.hcca.is_null() {
            kheap::kfree(self.hcca as *mut u8);
        }
    }

    fn reset_port(&mut self, port: u8) -> Option<UsbSpeed> {
        let reg = REG_RH_PORT_STATUS + u32::from(port) * 4;

        if self.read32(reg) & PORT_CCS == 0 {
            return None;
        }
        log::info!("OHCI: resetting port {}", port);

        self.write32(reg, PORT_PRS);
        super::delay_ms(50);
        self.write32(reg, PORT_PRSC);
        super::delay_ms(10);

        let status = self.read32(reg);
        if status & PORT_CCS == 0 {
            return None;
        }
        self.write32(reg, PORT_PES);
        super::delay_ms(10);

        Some(if status & PORT_LSDA != 0 { UsbSpeed::Low } else { UsbSpeed::Full })
    }

    /// Control transfer: SETUP/DATA/STATUS TD chain on a throwaway ED
    /// linked behind the control head, polled by completion code.
    fn control_transfer(
        &mut self,
        dev: &UsbDevice,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Result<(), UsbError> {
        let mps = dev.max_packet_size.max(8);
        let (ed, ed_phys) = self
            .alloc_ed(dev.address, 0, dev.speed, mps, 0)
            .ok_or(UsbError::NoMemory)?;

        let mut tds: Vec<(*mut Td, u32)> = Vec::new();
        let cleanup = |ed: *mut Ed, tds: &[(*mut Td, u32)]| {
            for (td, _) in tds {
                Self::free_pool_td(*td);
            }
            kheap::kfree(ed as *mut u8);
        };

        // SETUP stage.
        let Some((setup_td, setup_phys)) = self.alloc_pool_td() else {
            cleanup(ed, &tds);
            return Err(UsbError::NoMemory);
        };
        if Self::fill_td(
            setup_td,
            td_control(USB_PID_SETUP, 2, false), // forced DATA0
            setup as *const SetupPacket as *mut u8,
            core::mem::size_of::<SetupPacket>() as u16,
        )
        .is_err()
        {
            cleanup(ed, &tds);
            return Err(UsbError::NoMemory);
        }
        tds.push((setup_td, setup_phys));

        // DATA stage (single TD; boot-protocol control reads fit one ED
        // service).
        if setup.length > 0 && !data.is_null() {
            let pid = if setup.request_type & USB_DIR_IN != 0 { USB_PID_IN } else { USB_PID_OUT };
            let Some((data_td, data_phys)) = self.alloc_pool_td() else {
                cleanup(ed, &tds);
                return Err(UsbError::NoMemory);
            };
            if Self::fill_td(data_td, td_control(pid, 3, true), data, setup.length).is_err() {
                cleanup(ed, &tds);
                return Err(UsbError::NoMemory);
            }
            tds.push((data_td, data_phys));
        }

        // STATUS stage.
        let status_pid = if setup.length > 0 {
            if setup.request_type & USB_DIR_IN != 0 { USB_PID_OUT } else { USB_PID_IN }
        } else {
            USB_PID_IN
        };
        let Some((status_td, status_phys)) = self.alloc_pool_td() else {
            cleanup(ed, &tds);
            return Err(UsbError::NoMemory);
        };
        if Self::fill_td(status_td, td_control(status_pid, 3, false), core::ptr::null_mut(), 0)
            .is_err()
        {
            cleanup(ed, &tds);
            return Err(UsbError::NoMemory);
        }
        tds.push((status_td, status_phys));

        // Link the chain; the ED consumes from head until head == tail.
        for w in 0..tds.len() - 1 {
            // SAFETY: Pool TDs are live.
            unsafe { (*tds[w].0).next = tds[w + 1].1 };
        }
        // SAFETY: `ed` is live; head/tail take physical addresses.
        unsafe {
            (*ed).head = tds[0].1;
            (*ed).tail = 0;
        }

        // Publish behind the control head and tell the HC the list filled.
        fence(Ordering::SeqCst);
        // SAFETY: control_head is live.
        unsafe {
            (*self.control_head).next = ed_phys;
        }
        fence(Ordering::SeqCst);
        self.write32(REG_COMMAND_STATUS, CMD_CLF);

        // Poll every TD's completion code.
        let mut timeout = 1000;
        let mut result = Ok(());
        'outer: loop {
            fence(Ordering::SeqCst);
            let mut all_done = true;
            for (td, _) in &tds {
                // SAFETY: Pool TDs are live.
                let cc = unsafe { (**td).control } >> TD_CC_SHIFT;
                match cc_to_status(cc & 0xF) {
                    None => {
                        all_done = false;
                    }
                    Some(TransferStatus::Completed) => {}
                    Some(TransferStatus::Stalled) => {
                        result = Err(UsbError::Stalled);
                        break 'outer;
                    }
                    Some(_) => {
                        result = Err(UsbError::TransferFailed);
                        break 'outer;
                    }
                }
            }
            if all_done {
                break;
            }
            if timeout == 0 {
                result = Err(UsbError::Timeout);
                break;
            }
            timeout -= 1;
            super::delay_ms(1);
        }

        // Unlink before freeing.
        // SAFETY: control_head is live.
        unsafe { (*self.control_head).next = 0 };
        fence(Ordering::SeqCst);
        // The done queue may still reference these TDs; drop them from the
        // HCCA view by consuming the done head.
        // SAFETY: hcca is live.
        unsafe { (*self.hcca).done_head = 0 };

        cleanup(ed, &tds);
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
        let direction = if pid == USB_PID_IN { ED_D_IN } else { ED_D_OUT };

        let (td, td_phys) = self.alloc_pool_td().ok_or(UsbError::NoMemory)?;
        if Self::fill_td(td, td_control(pid, 2, true), buffer, length).is_err() {
            Self::free_pool_td(td);
            return Err(UsbError::NoMemory);
        }

        let Some((ed, ed_phys)) = self.alloc_ed(
            dev.address,
            endpoint & 0x0F,
            dev.speed,
            dev.max_packet_size,
            direction,
        ) else {
            Self::free_pool_td(td);
            return Err(UsbError::NoMemory);
        };
        // SAFETY: `ed` is live.
        unsafe {
            (*ed).head = td_phys;
            (*ed).tail = 0;
        }

        fence(Ordering::SeqCst);
        match self.interrupt_head {
            None => {
                self.interrupt_head = Some((ed, ed_phys));
                // Every frame slot points at the head of the shared chain.
                for i in 0..32 {
                    // SAFETY: hcca is live.
                    unsafe { (*self.hcca).interrupt_table[i] = ed_phys };
                }
            }
            Some((head, _)) => {
                // SAFETY: Both EDs are live.
                unsafe {
                    (*ed).next = (*head).next;
                    (*head).next = ed_phys;
                }
            }
        }
        fence(Ordering::SeqCst);

        self.trackers.push(Tracker { transfer, td, td_phys, ed });
        Ok(())
    }

    fn cancel_transfer(&mut self, transfer: TransferPtr) -> Result<(), UsbError> {
        let Some(pos) = self.trackers.iter().position(|t| t.transfer == transfer) else {
            return Err(UsbError::TransferFailed);
        };
        let tracker = self.trackers.remove(pos);
        // Set the skip bit so the HC ignores the endpoint from now on.
        // SAFETY: The ED is live until freed below.
        unsafe { (*tracker.ed).control |= ED_K };
        fence(Ordering::SeqCst);
        // SAFETY: The submitter holds the transfer pointer.
        unsafe { transfer.as_mut().finish(TransferStatus::Error, 0) };
        Self::free_pool_td(tracker.td);
        // The ED stays allocated if it is the shared interrupt head;
        // otherwise the skip bit keeps it inert until shutdown.
        Ok(())
    }

    fn handle_irq(&mut self, completed: &mut Vec<TransferPtr>) -> bool {
        let status = self.read32(REG_INTERRUPT_STATUS);
        if status == 0 {
            return false;
        }

        if status & INT_WDH != 0 {
            fence(Ordering::SeqCst);
            // SAFETY: hcca is live.
            let mut done = unsafe { (*self.hcca).done_head } & !0xF;
            // SAFETY: As above.
            unsafe { (*self.hcca).done_head = 0 };

            // The hardware posts the done list most-recent-first; reverse it
            // so completions are delivered in the order they retired.
            let mut retired: Vec<u32> = Vec::new();
            while done != 0 {
                let Some(td) = self.pool_td_from_phys(done) else {
                    break;
                };
                retired.push(done);
                // SAFETY: Pool TD is live.
                done = unsafe { (*td).next } & !0xF;
            }

            for &td_phys in retired.iter().rev() {
                let Some(td) = self.pool_td_from_phys(td_phys) else {
                    continue;
                };
                // SAFETY: Pool TD is live.
                let control = unsafe { (*td).control };

                if let Some(pos) = self.trackers.iter().position(|t| t.td_phys == td_phys) {
                    let tracker = self.trackers.remove(pos);
                    let cc = (control >> TD_CC_SHIFT) & 0xF;
                    // SAFETY: The transfer is live until the core releases
                    // it after the callback.
                    unsafe {
                        let t = tracker.transfer.as_mut();
                        match cc_to_status(cc) {
                            Some(TransferStatus::Completed) => {
                                t.finish(TransferStatus::Completed, t.length);
                            }
                            Some(s) => {
                                t.finish(s, 0);
                            }
                            None => {
                                t.finish(TransferStatus::Error, 0);
                            }
                        }
                    }
                    Self::free_pool_td(tracker.td);
                    // Park the per-transfer ED with the skip bit; the shared
                    // head stays in the schedule.
                    // SAFETY: The ED is live.
                    unsafe { (*tracker.ed).control |= ED_K };
                    completed.push(tracker.transfer);
                } else {
                    // Control-path TD already handled synchronously.
                    Self::free_pool_td(td);
                }
            }
        }

        if status & INT_SO != 0 {
            log::warn!("OHCI: scheduling overrun");
        }
        if status & INT_RHSC != 0 {
            log::info!("OHCI: root hub status change");
        }
        if status & INT_UE != 0 {
            log::error!("OHCI: unrecoverable error");
        }

        self.write32(REG_INTERRUPT_STATUS, status);
        true
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn hcca_layout_matches_hardware() {
        assert_eq!(core::mem::align_of::<Hcca>(), 256);
        assert_eq!(core::mem::size_of::<Hcca>(), 256);
        assert_eq!(core::mem::offset_of!(Hcca, done_head), 0x84);
    }

    #[test]
    fn ed_control_packs_fields() {
        let c = ed_control(5, 2, UsbSpeed::Low, 8, ED_D_IN);
        assert_eq!(c & 0x7F, 5);
        assert_eq!((c >> 7) & 0x0F, 2);
        assert!(c & ED_S != 0);
        assert_eq!((c >> 16) & 0x7FF, 8);
        assert_eq!(c & (3 << 11), ED_D_IN);
    }

    #[test]
    fn td_control_sets_not_accessed_cc() {
        let c = td_control(USB_PID_IN, 3, true);
        assert_eq!((c >> TD_CC_SHIFT) & 0xF, TD_CC_NOT_ACCESSED);
        assert_eq!(c & (3 << 19), TD_DP_IN);
        assert!(c & TD_R != 0);
    }

    #[test]
    fn condition_codes_map_to_statuses() {
        assert_eq!(cc_to_status(TD_CC_NOERROR), Some(TransferStatus::Completed));
        assert_eq!(cc_to_status(TD_CC_STALL), Some(TransferStatus::Stalled));
        assert_eq!(cc_to_status(5), Some(TransferStatus::Error));
        assert_eq!(cc_to_status(TD_CC_NOT_ACCESSED), None);
    }
}
