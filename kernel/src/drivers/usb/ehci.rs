//! EHCI host controller (USB 2.0, memory-mapped register file)
//!
//! Two schedules: a circular async list of queue heads whose reclaim head
//! carries the H bit, used for control transfers, and a 1024-entry
//! periodic frame list feeding a tree of eight interval queue heads
//! (1, 2, 4, ... 128 microframe periods) used for interrupt transfers.
//! Control transfers build a SETUP/DATA/STATUS qTD chain on a fresh QH
//! spliced in right after the reclaim head; the inserting path records the
//! predecessor so the unlink never has to search the ring.

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
use crate::mm::paging;

// Capability registers
const CAP_CAPLENGTH: usize = 0x00;
const CAP_HCSPARAMS: usize = 0x04;

// Operational registers (offsets from op base)
const OP_USBCMD: u32 = 0x00;
const OP_USBSTS: u32 = 0x04;
const OP_USBINTR: u32 = 0x08;
const OP_PERIODICLISTBASE: u32 = 0x14;
const OP_ASYNCLISTADDR: u32 = 0x18;
const OP_CONFIGFLAG: u32 = 0x40;
const OP_PORTSC: u32 = 0x44;

// USBCMD bits
const CMD_RS: u32 = 1 << 0;
const CMD_HCRESET: u32 = 1 << 1;
const CMD_FLS_1024: u32 = 0 << 2;
const CMD_PSE: u32 = 1 << 4;
const CMD_ASE: u32 = 1 << 5;
const CMD_IAAD: u32 = 1 << 6;
const CMD_ITC_SHIFT: u32 = 16;

// USBSTS bits
const STS_USBINT: u32 = 1 << 0;
const STS_ERROR: u32 = 1 << 1;
const STS_PCD: u32 = 1 << 2;
const STS_IAA: u32 = 1 << 5;
const STS_HCHALTED: u32 = 1 << 12;
const STS_PSS: u32 = 1 << 14;
const STS_ASS: u32 = 1 << 15;

// USBINTR bits
const INTR_USBINT: u32 = 1 << 0;
const INTR_ERROR: u32 = 1 << 1;
const INTR_PCD: u32 = 1 << 2;
const INTR_FLR: u32 = 1 << 3;
const INTR_HSE: u32 = 1 << 4;
const INTR_IAA: u32 = 1 << 5;

// PORTSC bits
const PORT_CCS: u32 = 1 << 0;
const PORT_CSC: u32 = 1 << 1;
const PORT_PED: u32 = 1 << 2;
const PORT_PEDC: u32 = 1 << 3;
const PORT_OCC: u32 = 1 << 5;
const PORT_PR: u32 = 1 << 8;

const CONFIGFLAG_CF: u32 = 1 << 0;

// qTD token bits
const QTD_STATUS_ACTIVE: u32 = 1 << 7;
const QTD_STATUS_HALTED: u32 = 1 << 6;
const QTD_STATUS_DBERR: u32 = 1 << 5;
const QTD_STATUS_BABBLE: u32 = 1 << 4;
const QTD_STATUS_XACTERR: u32 = 1 << 3;
const QTD_PID_OUT: u32 = 0 << 8;
const QTD_PID_IN: u32 = 1 << 8;
const QTD_PID_SETUP: u32 = 2 << 8;
const QTD_CERR_3: u32 = 3 << 10;
const QTD_IOC: u32 = 1 << 15;
const QTD_TOTAL_SHIFT: u32 = 16;
const QTD_TOGGLE: u32 = 1 << 31;

const QTD_ERROR_BITS: u32 =
    QTD_STATUS_HALTED | QTD_STATUS_DBERR | QTD_STATUS_BABBLE | QTD_STATUS_XACTERR;

// QH characteristics bits
const QH_CH_ENDPT_SHIFT: u32 = 8;
const QH_CH_EPS_FULL: u32 = 0 << 12;
const QH_CH_EPS_LOW: u32 = 1 << 12;
const QH_CH_EPS_HIGH: u32 = 2 << 12;
const QH_CH_DTC: u32 = 1 << 14;
const QH_CH_H: u32 = 1 << 15;
const QH_CH_MAXPKT_SHIFT: u32 = 16;
const QH_CH_RL_SHIFT: u32 = 28;

// Link pointer bits
const LP_TERMINATE: u32 = 1 << 0;
const LP_TYPE_QH: u32 = 1 << 1;
const LP_ADDR_MASK: u32 = 0xFFFF_FFE0;

const FRAMELIST_COUNT: usize = 1024;
const QTD_POOL_COUNT: usize = 32;
const INTERVAL_LEVELS: usize = 8;
/// Index of the 8 ms (128-microframe is index 7; 8 ms = 8 frames -> 2^3).
const INTERVAL_8MS: usize = 3;

/// Queue element transfer descriptor, 32-byte aligned.
#[repr(C, align(32))]
struct Qtd {
    next: u32,
    alt_next: u32,
    token: u32,
    buffer: [u32; 5],
    _sw: [u32; 3],
}

/// Queue head, 32-byte aligned. The overlay area mirrors the qTD layout.
#[repr(C, align(32))]
struct Qh {
    link: u32,
    characteristics: u32,
    capabilities: u32,
    current_qtd: u32,
    // Transfer overlay
    next_qtd: u32,
    alt_next_qtd: u32,
    token: u32,
    buffer: [u32; 5],
    _sw: [u32; 4],
}

/// The interval-tree slot a frame number feeds: the largest 2^k (k < 8)
/// that divides the frame index.
fn interval_index_for_frame(frame: usize) -> usize {
    for j in (0..INTERVAL_LEVELS).rev() {
        if frame % (1 << j) == 0 {
            return j;
        }
    }
    0
}

fn qtd_token(pid: u8, length: u16, toggle: bool) -> u32 {
    let pid_bits = match pid {
        USB_PID_SETUP => QTD_PID_SETUP,
        USB_PID_IN => QTD_PID_IN,
        _ => QTD_PID_OUT,
    };
    let mut token = QTD_STATUS_ACTIVE
        | QTD_CERR_3
        | ((length as u32) << QTD_TOTAL_SHIFT)
        | pid_bits
        | QTD_IOC;
    if toggle {
        token |= QTD_TOGGLE;
    }
    token
}

/// Bytes moved = requested - remaining (token bits 30:16).
fn qtd_actual_len(token: u32, requested: u16) -> u16 {
    let remaining = ((token >> QTD_TOTAL_SHIFT) & 0x7FFF) as u16;
    requested.saturating_sub(remaining)
}

struct Tracker {
    transfer: TransferPtr,
    qtd: *mut Qtd,
    qh: *mut Qh,
    qh_phys: u32,
}

pub struct EhciController {
    pci: PciDevice,
    op_base: *mut u32,
    num_ports: u8,
    periodic_list: Option<DmaBuffer>,
    qtd_pool: *mut Qtd,
    qtd_pool_phys: u64,
    async_qh: *mut Qh,
    async_qh_phys: u32,
    interrupt_qhs: [(*mut Qh, u32); INTERVAL_LEVELS],
    trackers: Vec<Tracker>,
}

// SAFETY: Descriptor memory is owned by the controller and only touched
// under the USB core lock with interrupts disabled.
unsafe impl Send for EhciController {}

/// Probe an EHCI function: map the BAR, locate the operational registers.
pub fn probe(pci_dev: PciDevice) -> Option<Box<EhciController>> {
    let bar0 = pci::read_config(pci_dev.bus, pci_dev.device, pci_dev.function, 0x10);
    let mmio_phys = (bar0 & 0xFFFF_FFF0) as u64;

    log::info!("EHCI: BAR0 at {:#x}", mmio_phys);
    let mmio = paging::ioremap(mmio_phys, 8192)?.as_mut_ptr::<u8>();

    // SAFETY: The capability area starts at the mapped BAR base.
    let cap_length = unsafe { core::ptr::read_volatile(mmio.add(CAP_CAPLENGTH)) };
    if cap_length == 0 || cap_length > 0x40 {
        log::error!("EHCI: invalid capability length {:#x}", cap_length);
        return None;
    }

    pci::enable_bus_mastering(&pci_dev);
    pci::enable_memory_space(&pci_dev);

    // SAFETY: HCSPARAMS lies within the mapped capability area.
    let hcsparams =
        unsafe { core::ptr::read_volatile(mmio.add(CAP_HCSPARAMS) as *const u32) };
    let num_ports = (hcsparams & 0x0F) as u8;
    log::info!("EHCI: {} ports, capability length {:#x}", num_ports, cap_length);

    Some(Box::new(EhciController {
        pci: pci_dev,
        // SAFETY: The operational registers start cap_length bytes in.
        op_base: unsafe { mmio.add(cap_length as usize) as *mut u32 },
        num_ports,
        periodic_list: None,
        qtd_pool: core::ptr::null_mut(),
        qtd_pool_phys: 0,
        async_qh: core::ptr::null_mut(),
        async_qh_phys: 0,
        interrupt_qhs: [(core::ptr::null_mut(), 0); INTERVAL_LEVELS],
        trackers: Vec::new(),
    }))
}

impl EhciController {
    fn read_op(&self, reg: u32) -> u32 {
        // SAFETY: `reg` is a defined operational register offset.
        unsafe { core::ptr::read_volatile(self.op_base.add(reg as usize / 4)) }
    }

    fn write_op(&self, reg: u32, value: u32) {
        // SAFETY: As in read_op.
        unsafe { core::ptr::write_volatile(self.op_base.add(reg as usize / 4), value) }
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        log::info!("EHCI: resetting");

        self.write_op(OP_USBCMD, self.read_op(OP_USBCMD) & !CMD_RS);
        let mut timeout = 1000;
        while timeout > 0 && self.read_op(OP_USBSTS) & STS_HCHALTED == 0 {
            super::delay_ms(1);
            timeout -= 1;
        }
        if timeout == 0 {
            log::error!("EHCI: failed to halt");
            return Err(UsbError::HardwareFault);
        }

        self.write_op(OP_USBCMD, self.read_op(OP_USBCMD) | CMD_HCRESET);
        timeout = 1000;
        while timeout > 0 && self.read_op(OP_USBCMD) & CMD_HCRESET != 0 {
            super::delay_ms(1);
            timeout -= 1;
        }
        if timeout == 0 {
            log::error!("EHCI: reset timeout");
            return Err(UsbError::HardwareFault);
        }
        Ok(())
    }

    fn create_qh(
        &self,
        address: u8,
        endpoint: u8,
        speed: UsbSpeed,
        max_packet: u16,
    ) -> Option<(*mut Qh, u32)> {
        let qh = kheap::kmalloc_aligned(core::mem::size_of::<Qh>(), 32) as *mut Qh;
        if qh.is_null() {
            return None;
        }

        let eps = match speed {
            UsbSpeed::High => QH_CH_EPS_HIGH,
            UsbSpeed::Full => QH_CH_EPS_FULL,
            UsbSpeed::Low => QH_CH_EPS_LOW,
        };
        let characteristics = (u32::from(address) & 0x7F)
            | ((u32::from(endpoint) & 0x0F) << QH_CH_ENDPT_SHIFT)
            | ((u32::from(max_packet) & 0x7FF) << QH_CH_MAXPKT_SHIFT)
            | eps
            | QH_CH_DTC
            | (15 << QH_CH_RL_SHIFT);

        // Split-transaction masks for full/low-speed control endpoints
        // reached through a high-speed hub.
        let capabilities = if endpoint == 0 && speed != UsbSpeed::High {
            0x01 | (0x1C << 8)
        } else {
            0
        };

        // SAFETY: Fresh 32-byte-aligned allocation of Qh size.
        unsafe {
            (*qh).link = LP_TERMINATE;
            (*qh).characteristics = characteristics;
            (*qh).capabilities = capabilities;
            (*qh).current_qtd = 0;
            (*qh).next_qtd = LP_TERMINATE;
            (*qh).alt_next_qtd = LP_TERMINATE;
            (*qh).token = 0;
            (*qh).buffer = [0; 5];
            (*qh)._sw = [0; 4];
        }

        let phys = super::virt_to_phys_dma(qh as u64)? as u32;
        Some((qh, phys))
    }

    /// Take a free qTD from the pool (terminate+zero-token marks free).
    fn alloc_qtd(&mut self) -> Option<(*mut Qtd, u32)> {
        for i in 0..QTD_POOL_COUNT {
            // SAFETY: The pool is a live allocation of QTD_POOL_COUNT qTDs.
            unsafe {
                let qtd = self.qtd_pool.add(i);
                if (*qtd).next == LP_TERMINATE && (*qtd).token == 0 {
                    (*qtd).next = 0xDEAD_BEEF; // claimed marker until filled
                    let phys =
                        (self.qtd_pool_phys + (i * core::mem::size_of::<Qtd>()) as u64) as u32;
                    return Some((qtd, phys));
                }
            }
        }
        None
    }

    fn free_qtd(qtd: *mut Qtd) {
        // SAFETY: `qtd` points into the live pool.
        unsafe {
            (*qtd).next = LP_TERMINATE;
            (*qtd).alt_next = LP_TERMINATE;
            (*qtd).token = 0;
            (*qtd).buffer = [0; 5];
        }
    }

    /// Fill a qTD, translating each touched page to its physical address.
    fn fill_qtd(
        qtd: *mut Qtd,
        pid: u8,
        buffer: *mut u8,
        length: u16,
        toggle: bool,
    ) -> Result<(), UsbError> {
        let mut buffers = [0u32; 5];
        if length > 0 && !buffer.is_null() {
            let virt = buffer as u64;
            let phys = super::virt_to_phys_dma(virt).ok_or(UsbError::NoMemory)?;
            buffers[0] = phys as u32;
            for (i, slot) in buffers.iter_mut().enumerate().skip(1) {
                if length as usize <= 4096 * i {
                    break;
                }
                let page_phys =
                    super::virt_to_phys_dma(virt + (4096 * i) as u64).ok_or(UsbError::NoMemory)?;
                *slot = (page_phys as u32) & 0xFFFF_F000;
            }
        }
        // SAFETY: `qtd` is a live pool entry claimed by alloc_qtd.
        unsafe {
            (*qtd).next = LP_TERMINATE;
            (*qtd).alt_next = LP_TERMINATE;
            (*qtd).token = qtd_token(pid, length, toggle);
            (*qtd).buffer = buffers;
        }
        Ok(())
    }

    fn setup_periodic_schedule(&mut self) -> Result<(), UsbError> {
        log::info!("EHCI: setting up periodic schedule");

        for i in 0..INTERVAL_LEVELS {
            let (qh, phys) = self.create_qh(0, 0, UsbSpeed::High, 8).ok_or(UsbError::NoMemory)?;
            // SAFETY: The QH is live; placeholder executes in microframe 0.
            unsafe { (*qh).capabilities = 0x01 };
            self.interrupt_qhs[i] = (qh, phys);
        }

        // Tree: longer intervals drain into shorter ones.
        for i in (1..INTERVAL_LEVELS).rev() {
            let (qh, _) = self.interrupt_qhs[i];
            let (_, next_phys) = self.interrupt_qhs[i - 1];
            // SAFETY: Both QHs are live.
            unsafe { (*qh).link = next_phys | LP_TYPE_QH };
        }
        // SAFETY: The 1-microframe QH terminates the tree.
        unsafe { (*self.interrupt_qhs[0].0).link = LP_TERMINATE };

        fence(Ordering::SeqCst);

        let list = self.periodic_list.as_ref().ok_or(UsbError::NoMemory)?;
        let entries = list.virt as *mut u32;
        for i in 0..FRAMELIST_COUNT {
            let idx = interval_index_for_frame(i);
            let (_, phys) = self.interrupt_qhs[idx];
            // SAFETY: The DMA buffer covers FRAMELIST_COUNT u32 entries.
            unsafe { *entries.add(i) = phys | LP_TYPE_QH };
        }

        fence(Ordering::SeqCst);
        log::info!("EHCI: periodic schedule tree configured");
        Ok(())
    }

    /// Splice a QH into the ring right after the reclaim head and remember
    /// that the head is its predecessor.
    fn async_insert(&mut self, qh: *mut Qh, qh_phys: u32) {
        // SAFETY: Both QHs are live; fences order the publication.
        unsafe {
            (*qh).link = (*self.async_qh).link;
            fence(Ordering::SeqCst);
            (*self.async_qh).link = qh_phys | LP_TYPE_QH;
        }
        fence(Ordering::SeqCst);
    }

    /// Ring the async-advance doorbell and wait briefly for the ack.
    ///
    /// An IAA timeout is non-fatal: with interrupts enabled the handler may
    /// consume the status bit first, and the schedule advances regardless.
    fn ring_doorbell(&mut self) {
        self.write_op(OP_USBCMD, self.read_op(OP_USBCMD) | CMD_IAAD);
        let mut timeout = 100;
        while timeout > 0 {
            let sts = self.read_op(OP_USBSTS);
            if sts & STS_IAA != 0 {
                self.write_op(OP_USBSTS, STS_IAA);
                return;
            }
            super::delay_ms(1);
            timeout -= 1;
        }
        log::debug!("EHCI: IAA timeout (continuing anyway)");
    }

    /// Unlink through the recorded predecessor (the reclaim head; the
    /// single-threaded control path never lets another QH slip between).
    fn async_unlink(&mut self, qh: *mut Qh, qh_phys: u32) {
        // SAFETY: Both QHs are live.
        unsafe {
            debug_assert_eq!((*self.async_qh).link & LP_ADDR_MASK, qh_phys & LP_ADDR_MASK);
            (*self.async_qh).link = (*qh).link;
        }
        fence(Ordering::SeqCst);

        // Let the schedule settle before the descriptors are recycled.
        super::delay_ms(1);
    }

    /// Unlink an interrupt QH from the 8 ms chain by walking the known
    /// nodes (interval head plus tracked QHs).
    fn periodic_unlink(&mut self, qh_phys: u32) {
        let (head, _) = self.interrupt_qhs[INTERVAL_8MS];
        let mut prev = head;
        loop {
            // SAFETY: `prev` is either the interval head or a tracked QH,
            // both live.
            let next = unsafe { (*prev).link };
            if next & LP_TERMINATE != 0 {
                return;
            }
            let next_phys = next & LP_ADDR_MASK;
            if next_phys == qh_phys & LP_ADDR_MASK {
                let target = self
                    .trackers
                    .iter()
                    .find(|t| t.qh_phys & LP_ADDR_MASK == next_phys)
                    .map(|t| t.qh);
                if let Some(t) = target {
                    // SAFETY: Both QHs are live.
                    unsafe { (*prev).link = (*t).link };
                    fence(Ordering::SeqCst);
                }
                return;
            }
            // Hop to the tracked QH owning next_phys.
            match self.trackers.iter().find(|t| t.qh_phys & LP_ADDR_MASK == next_phys) {
                Some(t) => prev = t.qh,
                None => return,
            }
        }
    }
}

impl HostController for EhciController {
    fn name(&self) -> &'static str {
        "EHCI"
    }

    fn num_ports(&self) -> u8 {
        self.num_ports
    }

    fn irq_line(&self) -> u8 {
        self.pci.interrupt_line
    }

    fn init(&mut self) -> Result<(), UsbError> {
        self.reset()?;

        // Periodic frame list (DMA, 4 KiB aligned).
        let list = dma::dma_alloc(FRAMELIST_COUNT * 4, 4096).map_err(|_| UsbError::NoMemory)?;
        let entries = list.virt as *mut u32;
        for i in 0..FRAMELIST_COUNT {
            // SAFETY: The buffer covers FRAMELIST_COUNT entries.
            unsafe { *entries.add(i) = LP_TERMINATE };
        }
        self.periodic_list = Some(list);

        // qTD pool.
        let pool =
            kheap::kmalloc_aligned(core::mem::size_of::<Qtd>() * QTD_POOL_COUNT, 32) as *mut Qtd;
        if pool.is_null() {
            return Err(UsbError::NoMemory);
        }
        self.qtd_pool = pool;
        self.qtd_pool_phys = super::virt_to_phys_dma(pool as u64).ok_or(UsbError::NoMemory)?;
        for i in 0..QTD_POOL_COUNT {
            // SAFETY: Pool is a live allocation.
            Self::free_qtd(unsafe { pool.add(i) });
        }

        self.setup_periodic_schedule()?;

        // Async ring: one reclaim head pointing at itself.
        let (async_qh, async_phys) =
            self.create_qh(0, 0, UsbSpeed::High, 64).ok_or(UsbError::NoMemory)?;
        // SAFETY: The QH is live.
        unsafe {
            (*async_qh).characteristics |= QH_CH_H;
            (*async_qh).link = async_phys | LP_TYPE_QH;
        }
        self.async_qh = async_qh;
        self.async_qh_phys = async_phys;

        fence(Ordering::SeqCst);

        let periodic_phys = self.periodic_list.as_ref().map(|l| l.phys.as_u64()).unwrap_or(0);
        self.write_op(OP_PERIODICLISTBASE, periodic_phys as u32);
        self.write_op(OP_ASYNCLISTADDR, self.async_qh_phys);

        self.write_op(
            OP_USBINTR,
            INTR_USBINT | INTR_ERROR | INTR_PCD | INTR_IAA | INTR_HSE | INTR_FLR,
        );

        // Stage 1: run with the async schedule only.
        log::info!("EHCI: starting controller (stage 1: async only)");
        self.write_op(OP_USBCMD, CMD_RS | CMD_ASE | CMD_FLS_1024 | (8 << CMD_ITC_SHIFT));
        let mut timeout = 1000;
        loop {
            let sts = self.read_op(OP_USBSTS);
            if sts & STS_HCHALTED == 0 && sts & STS_ASS != 0 {
                break;
            }
            if timeout == 0 {
                log::error!("EHCI: async schedule failed to start (status {:#x})", sts);
                return Err(UsbError::HardwareFault);
            }
            timeout -= 1;
            super::delay_ms(1);
        }
        log::info!("EHCI: async schedule running");

        // Stage 2: add the periodic schedule.
        self.write_op(OP_USBCMD, self.read_op(OP_USBCMD) | CMD_PSE);
        timeout = 1000;
        loop {
            let sts = self.read_op(OP_USBSTS);
            if sts & STS_PSS != 0 {
                break;
            }
            if timeout == 0 {
                log::error!("EHCI: periodic schedule failed to start (status {:#x})", sts);
                return Err(UsbError::HardwareFault);
            }
            timeout -= 1;
            super::delay_ms(1);
        }

        // Route every port to this controller, then let it settle.
        self.write_op(OP_CONFIGFLAG, CONFIGFLAG_CF);
        super::delay_ms(5);

        let sts = self.read_op(OP_USBSTS);
        if sts & STS_HCHALTED != 0 || sts & STS_ASS == 0 || sts & STS_PSS == 0 {
            log::error!("EHCI: controller state unstable (status {:#x})", sts);
            return Err(UsbError::HardwareFault);
        }
        log::info!("EHCI: controller running (async + periodic)");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.write_op(OP_USBINTR, 0);
        self.write_op(OP_USBCMD, self.read_op(OP_USBCMD) & !CMD_RS);
        let mut timeout = 1000;
        while timeout > 0 && self.read_op(OP_USBSTS) & STS_HCHALTED == 0 {
            super::delay_ms(1);
            timeout -= 1;
        }

        for tr in core::mem::take(&mut self.trackers) {
            // SAFETY: The controller is halted; descriptors are quiescent.
            unsafe {
                tr.transfer.as_mut().finish(TransferStatus::Error, 0);
            }
            Self::free_qtd(tr.qtd);
            kheap::kfree(tr.qh as *mut u8);
        }
        for (qh, _) in self.interrupt_qhs {
            if !qh.is_null() {
                kheap::kfree(qh as *mut u8);
            }
        }
        if !self.async_qh.is_null() {
            kheap::kfree(self.async_qh as *mut u8);
        }
        if !self.qtd_pool.is_null() {
            kheap::kfree(self.qtd_pool as *mut u8);
        }
        if let Some(mut list) = self.periodic_list.take() {
            dma::dma_free(&mut list);
        }
    }

    fn reset_port(&mut self, port: u8) -> Option<UsbSpeed> {
        let reg = OP_PORTSC + u32::from(port) * 4;
        let status = self.read_op(reg);

        if status & PORT_CCS == 0 {
            return None;
        }

        // Assert reset with the enable bit clear, per the EHCI sequence.
        let mut s = status | PORT_PR;
        s &= !PORT_PED;
        self.write_op(reg, s);
        super::delay_ms(50);

        self.write_op(reg, self.read_op(reg) & !PORT_PR);
        let mut timeout = 20;
        while timeout > 0 && self.read_op(reg) & PORT_PR != 0 {
            super::delay_ms(1);
            timeout -= 1;
        }
        super::delay_ms(10);

        let status = self.read_op(reg);
        if status & PORT_CCS == 0 {
            return None;
        }
        if status & PORT_PED == 0 {
            // Full/low-speed device: belongs to the companion controller.
            log::info!("EHCI: port {} not enabled after reset (companion device)", port);
            return None;
        }
        Some(UsbSpeed::High)
    }

    /// Synchronous control transfer: SETUP qTD, optional DATA qTD, STATUS
    /// qTD, chained onto a fresh QH spliced into the async ring. The
    /// doorbell is rung and the chain polled until ACTIVE drops.
    fn control_transfer(
        &mut self,
        dev: &UsbDevice,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Result<(), UsbError> {
        let mps = dev.max_packet_size.max(8);
        let (qh, qh_phys) =
            self.create_qh(dev.address, 0, dev.speed, mps).ok_or(UsbError::NoMemory)?;

        let mut pool_qtds: Vec<*mut Qtd> = Vec::new();
        let cleanup = |qh: *mut Qh, qtds: &[*mut Qtd]| {
            for q in qtds {
                Self::free_qtd(*q);
            }
            kheap::kfree(qh as *mut u8);
        };

        // SETUP stage, always DATA0.
        let Some((setup_qtd, setup_phys)) = self.alloc_qtd() else {
            cleanup(qh, &pool_qtds);
            return Err(UsbError::NoMemory);
        };
        pool_qtds.push(setup_qtd);
        if Self::fill_qtd(
            setup_qtd,
            USB_PID_SETUP,
            setup as *const SetupPacket as *mut u8,
            core::mem::size_of::<SetupPacket>() as u16,
            false,
        )
        .is_err()
        {
            cleanup(qh, &pool_qtds);
            return Err(UsbError::NoMemory);
        }

        // DATA stage.
        let mut data_qtd: Option<(*mut Qtd, u32)> = None;
        if setup.length > 0 && !data.is_null() {
            let pid = if setup.request_type & USB_DIR_IN != 0 { USB_PID_IN } else { USB_PID_OUT };
            let Some((qtd, phys)) = self.alloc_qtd() else {
                cleanup(qh, &pool_qtds);
                return Err(UsbError::NoMemory);
            };
            pool_qtds.push(qtd);
            if Self::fill_qtd(qtd, pid, data, setup.length, true).is_err() {
                cleanup(qh, &pool_qtds);
                return Err(UsbError::NoMemory);
            }
            data_qtd = Some((qtd, phys));
        }

        // STATUS stage, opposite direction, DATA1.
        let status_pid = if setup.length > 0 {
            if setup.request_type & USB_DIR_IN != 0 { USB_PID_OUT } else { USB_PID_IN }
        } else {
            USB_PID_IN
        };
        let Some((status_qtd, status_phys)) = self.alloc_qtd() else {
            cleanup(qh, &pool_qtds);
            return Err(UsbError::NoMemory);
        };
        pool_qtds.push(status_qtd);
        if Self::fill_qtd(status_qtd, status_pid, core::ptr::null_mut(), 0, true).is_err() {
            cleanup(qh, &pool_qtds);
            return Err(UsbError::NoMemory);
        }

        // Chain: SETUP -> [DATA ->] STATUS.
        // SAFETY: All qTDs are live pool entries.
        unsafe {
            match data_qtd {
                Some((dq, dphys)) => {
                    (*setup_qtd).next = dphys;
                    (*dq).next = status_phys;
                }
                None => (*setup_qtd).next = status_phys,
            }
            (*status_qtd).next = LP_TERMINATE;

            // Attach the chain to the QH overlay.
            (*qh).next_qtd = setup_phys;
            (*qh).alt_next_qtd = LP_TERMINATE;
            (*qh).token = 0;
        }

        fence(Ordering::SeqCst);
        self.async_insert(qh, qh_phys);

        // Give the hardware a moment to pick up the new QH, then ring the
        // doorbell so it reloads its cached async-list pointers.
        super::delay_ms(2);
        self.ring_doorbell();

        // Poll until the whole chain goes inactive.
        let mut timeout = 1000;
        let mut done = false;
        while timeout > 0 {
            fence(Ordering::SeqCst);
            // SAFETY: qTDs stay live until freed below.
            let active = unsafe {
                (*setup_qtd).token & QTD_STATUS_ACTIVE != 0
                    || data_qtd
                        .map(|(q, _)| (*q).token & QTD_STATUS_ACTIVE != 0)
                        .unwrap_or(false)
                    || (*status_qtd).token & QTD_STATUS_ACTIVE != 0
            };
            if !active {
                done = true;
                break;
            }
            super::delay_ms(1);
            timeout -= 1;
        }

        // SAFETY: qTDs are live.
        let any_error = unsafe {
            (*setup_qtd).token & QTD_ERROR_BITS != 0
                || data_qtd.map(|(q, _)| (*q).token & QTD_ERROR_BITS != 0).unwrap_or(false)
                || (*status_qtd).token & QTD_ERROR_BITS != 0
        };
        // SAFETY: qTDs are live.
        let stalled = unsafe {
            ((*setup_qtd).token | (*status_qtd).token) & QTD_STATUS_HALTED != 0
        };

        self.async_unlink(qh, qh_phys);

        let result = if !done {
            log::error!("EHCI: control transfer timeout");
            Err(UsbError::Timeout)
        } else if any_error {
            log::error!("EHCI: control transfer error");
            if stalled {
                Err(UsbError::Stalled)
            } else {
                Err(UsbError::TransferFailed)
            }
        } else {
            Ok(())
        };

        cleanup(qh, &pool_qtds);
        result
    }

    /// Interrupt transfer: one qTD on a per-endpoint QH inserted into the
    /// 8 ms interval chain. The HID driver resubmits from the completion
    /// callback to keep polling.
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

        let (qtd, qtd_phys) = self.alloc_qtd().ok_or(UsbError::NoMemory)?;
        if Self::fill_qtd(qtd, pid, buffer, length, true).is_err() {
            Self::free_qtd(qtd);
            return Err(UsbError::NoMemory);
        }

        let Some((qh, qh_phys)) =
            self.create_qh(dev.address, endpoint & 0x0F, dev.speed, dev.max_packet_size)
        else {
            Self::free_qtd(qtd);
            return Err(UsbError::NoMemory);
        };
        // SAFETY: The QH is live.
        unsafe {
            (*qh).capabilities = 0x01; // execute in microframe 0
            (*qh).next_qtd = qtd_phys;
            (*qh).alt_next_qtd = LP_TERMINATE;
            (*qh).token = 0;
        }

        fence(Ordering::SeqCst);

        // Insert at the head of the 8 ms interval chain.
        let (interval_qh, _) = self.interrupt_qhs[INTERVAL_8MS];
        // SAFETY: Both QHs are live.
        unsafe {
            (*qh).link = (*interval_qh).link;
            fence(Ordering::SeqCst);
            (*interval_qh).link = qh_phys | LP_TYPE_QH;
        }
        fence(Ordering::SeqCst);

        self.trackers.push(Tracker { transfer, qtd, qh, qh_phys });
        Ok(())
    }

    fn cancel_transfer(&mut self, transfer: TransferPtr) -> Result<(), UsbError> {
        let Some(pos) = self.trackers.iter().position(|t| t.transfer == transfer) else {
            return Err(UsbError::TransferFailed);
        };
        let qh_phys = self.trackers[pos].qh_phys;
        self.periodic_unlink(qh_phys);

        let tracker = self.trackers.remove(pos);
        // SAFETY: Descriptors are live until freed below.
        unsafe {
            (*tracker.qtd).token &= !QTD_STATUS_ACTIVE;
            (*tracker.qh).token &= !QTD_STATUS_ACTIVE;
        }
        fence(Ordering::SeqCst);
        // SAFETY: The submitter holds the transfer pointer.
        unsafe { transfer.as_mut().finish(TransferStatus::Error, 0) };
        Self::free_qtd(tracker.qtd);
        kheap::kfree(tracker.qh as *mut u8);
        Ok(())
    }

    fn handle_irq(&mut self, completed: &mut Vec<TransferPtr>) -> bool {
        let status = self.read_op(OP_USBSTS);
        if status == 0 {
            return false;
        }

        if status & (STS_USBINT | STS_ERROR) != 0 {
            if status & STS_ERROR != 0 {
                log::error!("EHCI: error interrupt");
            }
            fence(Ordering::SeqCst);

            let mut i = 0;
            while i < self.trackers.len() {
                // SAFETY: Tracker qTDs are live.
                let token = unsafe { (*self.trackers[i].qtd).token };
                if token & QTD_STATUS_ACTIVE != 0 {
                    i += 1;
                    continue;
                }

                let qh_phys = self.trackers[i].qh_phys;
                self.periodic_unlink(qh_phys);
                let tracker = self.trackers.remove(i);

                // SAFETY: The transfer is live until the core releases it
                // after the callback.
                unsafe {
                    let t = tracker.transfer.as_mut();
                    if token & QTD_ERROR_BITS != 0 {
                        let s = if token & QTD_STATUS_HALTED != 0 {
                            TransferStatus::Stalled
                        } else {
                            TransferStatus::Error
                        };
                        t.finish(s, 0);
                    } else {
                        let len = qtd_actual_len(token, t.length);
                        t.finish(TransferStatus::Completed, len);
                    }
                }
                Self::free_qtd(tracker.qtd);
                kheap::kfree(tracker.qh as *mut u8);
                completed.push(tracker.transfer);
            }
        }

        if status & STS_PCD != 0 {
            for p in 0..self.num_ports {
                let reg = OP_PORTSC + u32::from(p) * 4;
                let ps = self.read_op(reg);
                if ps & (PORT_CSC | PORT_PEDC | PORT_OCC) != 0 {
                    self.write_op(reg, ps);
                }
            }
        }

        self.write_op(OP_USBSTS, status);
        true
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn descriptor_layouts_match_hardware() {
        assert_eq!(core::mem::align_of::<Qtd>(), 32);
        assert_eq!(core::mem::align_of::<Qh>(), 32);
        // The overlay area must mirror the qTD transfer fields.
        assert_eq!(core::mem::offset_of!(Qh, next_qtd), 16);
        assert_eq!(core::mem::offset_of!(Qh, token), 24);
    }

    #[test]
    fn token_encoding() {
        let t = qtd_token(USB_PID_IN, 8, true);
        assert!(t & QTD_STATUS_ACTIVE != 0);
        assert!(t & QTD_IOC != 0);
        assert!(t & QTD_TOGGLE != 0);
        assert_eq!((t >> 8) & 3, 1); // IN
        assert_eq!((t >> QTD_TOTAL_SHIFT) & 0x7FFF, 8);
        assert_eq!((t >> 10) & 3, 3); // CERR

        let s = qtd_token(USB_PID_SETUP, 8, false);
        assert_eq!((s >> 8) & 3, 2); // SETUP
        assert!(s & QTD_TOGGLE == 0);
    }

    #[test]
    fn actual_length_is_requested_minus_remaining() {
        // 8 requested, 0 remaining -> 8 transferred.
        let done = (QTD_CERR_3) | (0 << QTD_TOTAL_SHIFT);
        assert_eq!(qtd_actual_len(done, 8), 8);
        // 8 requested, 3 remaining -> 5 transferred.
        let short = 3 << QTD_TOTAL_SHIFT;
        assert_eq!(qtd_actual_len(short, 8), 5);
    }

    #[test]
    fn frame_slots_feed_the_largest_dividing_interval() {
        assert_eq!(interval_index_for_frame(0), 7);
        assert_eq!(interval_index_for_frame(1), 0);
        assert_eq!(interval_index_for_frame(2), 1);
        assert_eq!(interval_index_for_frame(4), 2);
        assert_eq!(interval_index_for_frame(6), 1);
        assert_eq!(interval_index_for_frame(8), 3);
        assert_eq!(interval_index_for_frame(128), 7);
        assert_eq!(interval_index_for_frame(384), 7);
    }

    #[test]
    fn error_bits_cover_the_token_failure_modes() {
        assert_eq!(
            QTD_ERROR_BITS,
            QTD_STATUS_HALTED | QTD_STATUS_DBERR | QTD_STATUS_BABBLE | QTD_STATUS_XACTERR
        );
    }
}
