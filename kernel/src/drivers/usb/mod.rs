//! USB core
//!
//! A controller-agnostic model over UHCI, OHCI and EHCI. Each controller
//! implements the [`HostController`] capability set; the core owns the
//! controller list, per-controller device lists and address assignment,
//! runs the enumeration pipeline, matches class drivers and routes
//! completions from the IRQ path to transfer callbacks.

pub mod ehci;
pub mod hid;
pub mod ohci;
pub mod transfer;
pub mod uhci;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;

pub use transfer::{Transfer, TransferCallback, TransferPtr, TransferStatus};

use crate::drivers::pci;

// Request types
pub const USB_REQ_TYPE_STANDARD: u8 = 0x00;
pub const USB_REQ_TYPE_CLASS: u8 = 0x20;
pub const USB_REQ_TYPE_VENDOR: u8 = 0x40;

// Request recipients
pub const USB_REQ_RECIPIENT_DEVICE: u8 = 0x00;
pub const USB_REQ_RECIPIENT_INTERFACE: u8 = 0x01;
pub const USB_REQ_RECIPIENT_ENDPOINT: u8 = 0x02;

// Standard requests
pub const USB_REQ_GET_STATUS: u8 = 0x00;
pub const USB_REQ_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQ_SET_FEATURE: u8 = 0x03;
pub const USB_REQ_SET_ADDRESS: u8 = 0x05;
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQ_SET_CONFIGURATION: u8 = 0x09;

// Descriptor types
pub const USB_DESC_DEVICE: u8 = 0x01;
pub const USB_DESC_CONFIGURATION: u8 = 0x02;
pub const USB_DESC_STRING: u8 = 0x03;
pub const USB_DESC_INTERFACE: u8 = 0x04;
pub const USB_DESC_ENDPOINT: u8 = 0x05;
pub const USB_DESC_HID: u8 = 0x21;

// Device classes
pub const USB_CLASS_PER_INTERFACE: u8 = 0x00;
pub const USB_CLASS_HID: u8 = 0x03;
pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;
pub const USB_CLASS_HUB: u8 = 0x09;

// Endpoint direction bit
pub const USB_DIR_OUT: u8 = 0x00;
pub const USB_DIR_IN: u8 = 0x80;

// Packet IDs (token values shared by UHCI and the descriptor builders)
pub const USB_PID_SETUP: u8 = 0x2D;
pub const USB_PID_IN: u8 = 0x69;
pub const USB_PID_OUT: u8 = 0xE1;

// PCI identity of USB host controllers
pub const PCI_CLASS_SERIAL_BUS: u8 = 0x0C;
pub const PCI_SUBCLASS_USB: u8 = 0x03;
pub const PCI_PROG_IF_UHCI: u8 = 0x00;
pub const PCI_PROG_IF_OHCI: u8 = 0x10;
pub const PCI_PROG_IF_EHCI: u8 = 0x20;

/// Bus speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    NoMemory,
    NoController,
    Timeout,
    Stalled,
    TransferFailed,
    InvalidEndpoint,
    HardwareFault,
    EnumerationFailed,
}

/// SETUP packet for control transfers.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Standard device descriptor (18 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

/// A device on some controller's bus.
pub struct UsbDevice {
    /// Assigned during enumeration; unique per controller, 1-127.
    pub address: u8,
    pub speed: UsbSpeed,
    pub port: u8,
    pub max_packet_size: u16,
    pub descriptor: DeviceDescriptor,
    /// Index of the owning controller slot.
    pub controller: usize,
    /// Matched driver, if any.
    pub driver: Option<&'static dyn UsbDriver>,
    /// Driver-private state (the HID driver parks its device record here).
    pub driver_data: *mut (),
    /// Live transfers submitted on this device.
    pub active_transfers: Vec<TransferPtr>,
}

/// Shared pointer to a live device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevPtr(NonNull<UsbDevice>);

// SAFETY: Devices are mutated with interrupts disabled on one CPU.
unsafe impl Send for DevPtr {}

impl DevPtr {
    pub fn as_ptr(&self) -> *mut UsbDevice {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The device must not have been freed.
    pub unsafe fn as_ref<'a>(&self) -> &'a UsbDevice {
        // SAFETY: Caller guarantees liveness.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// The device must not have been freed; exclusive access required
    /// (interrupts off).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut UsbDevice {
        // SAFETY: Caller guarantees exclusivity.
        unsafe { &mut *self.0.as_ptr() }
    }

    #[cfg(all(test, not(target_os = "none")))]
    pub(crate) fn dangling_for_tests() -> Self {
        Self(NonNull::dangling())
    }
}

/// The per-family capability set every host controller implements.
///
/// `handle_irq` runs in interrupt context with interrupts off; it may call
/// the kernel heap (descriptor recycling is documented to allocate).
pub trait HostController: Send {
    fn name(&self) -> &'static str;
    fn num_ports(&self) -> u8;
    fn irq_line(&self) -> u8;

    /// Reset + ring setup + schedule start.
    fn init(&mut self) -> Result<(), UsbError>;

    /// Stop schedules and release descriptor memory.
    fn shutdown(&mut self);

    /// Bus-reset one port. `Some(speed)` when a connected device came out
    /// of reset enabled; the core then enumerates it.
    fn reset_port(&mut self, port: u8) -> Option<UsbSpeed>;

    /// Synchronous control transfer on endpoint 0.
    fn control_transfer(
        &mut self,
        dev: &UsbDevice,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Result<(), UsbError>;

    /// Queue an asynchronous interrupt transfer; completion arrives through
    /// `handle_irq`.
    fn submit_interrupt_transfer(
        &mut self,
        dev: &UsbDevice,
        transfer: TransferPtr,
    ) -> Result<(), UsbError>;

    /// Unlink a pending transfer and mark it ERROR. The completion
    /// callback is never invoked for a cancelled transfer.
    fn cancel_transfer(&mut self, transfer: TransferPtr) -> Result<(), UsbError>;

    /// Drain hardware completions into `completed`; true when this
    /// controller had interrupt status to acknowledge.
    fn handle_irq(&mut self, completed: &mut Vec<TransferPtr>) -> bool;
}

/// A USB class/vendor driver.
pub trait UsbDriver: Sync {
    fn name(&self) -> &'static str;

    /// Match on `(vendor, product)` or on the device class/subclass.
    fn matches(&self, descriptor: &DeviceDescriptor) -> bool;

    fn probe(&self, dev: DevPtr) -> Result<(), UsbError>;

    fn disconnect(&self, dev: DevPtr);
}

struct ControllerSlot {
    hc: Box<dyn HostController>,
    devices: Vec<DevPtr>,
    /// Next address to assign on this controller (1-127, wrapping).
    next_address: u8,
}

struct UsbCore {
    controllers: Vec<ControllerSlot>,
}

static CORE: Mutex<UsbCore> = Mutex::new(UsbCore { controllers: Vec::new() });

static DRIVERS: Mutex<Vec<&'static dyn UsbDriver>> = Mutex::new(Vec::new());

/// Busy-wait roughly `ms` milliseconds (bring-up and synchronous paths).
pub(crate) fn delay_ms(ms: u64) {
    for _ in 0..ms.saturating_mul(100_000) {
        core::hint::spin_loop();
    }
}

/// Translate a kernel virtual address to the physical address hardware
/// must use, handling the heap window, identity-mapped low memory and
/// everything in between through the page tables.
pub(crate) fn virt_to_phys_dma(virt: u64) -> Option<u64> {
    use crate::mm::{kheap, paging, VirtualAddress};

    if virt >= kheap::KHEAP_START {
        return paging::virt_to_phys(VirtualAddress::new(virt)).map(|p| p.as_u64());
    }
    if virt < 0x4000_0000 {
        // Identity-mapped low memory (kernel text/data/stacks).
        return Some(virt);
    }
    paging::virt_to_phys(VirtualAddress::new(virt)).map(|p| p.as_u64())
}

/// Initialize the USB subsystem: find controllers on PCI, bring them up,
/// then enumerate every port.
pub fn init() {
    log::info!("initializing USB subsystem");

    scan_pci_bus();

    // Let the controllers stabilize before the first bus reset.
    delay_ms(10);

    enumerate_all_ports();

    log::info!("USB subsystem initialized");
}

fn scan_pci_bus() {
    let mut uhci_count = 0;
    let mut ohci_count = 0;
    let mut ehci_count = 0;

    pci::scan_class(PCI_CLASS_SERIAL_BUS, PCI_SUBCLASS_USB, |dev, prog_if| match prog_if {
        PCI_PROG_IF_UHCI => {
            log::info!(
                "found UHCI at {:02x}:{:02x}.{} IRQ {}",
                dev.bus,
                dev.device,
                dev.function,
                dev.interrupt_line
            );
            if let Some(hc) = uhci::probe(dev) {
                if register_controller(hc).is_ok() {
                    uhci_count += 1;
                }
            }
        }
        PCI_PROG_IF_OHCI => {
            log::info!(
                "found OHCI at {:02x}:{:02x}.{} IRQ {}",
                dev.bus,
                dev.device,
                dev.function,
                dev.interrupt_line
            );
            if let Some(hc) = ohci::probe(dev) {
                if register_controller(hc).is_ok() {
                    ohci_count += 1;
                }
            }
        }
        PCI_PROG_IF_EHCI => {
            log::info!(
                "found EHCI at {:02x}:{:02x}.{} IRQ {}",
                dev.bus,
                dev.device,
                dev.function,
                dev.interrupt_line
            );
            if let Some(hc) = ehci::probe(dev) {
                if register_controller(hc).is_ok() {
                    ehci_count += 1;
                }
            }
        }
        _ => {}
    });

    log::info!("found {} UHCI, {} OHCI, {} EHCI controllers", uhci_count, ohci_count, ehci_count);
}

/// Initialize and register a controller; hooks its IRQ line into the
/// shared USB interrupt handler.
pub fn register_controller(mut hc: Box<dyn HostController>) -> Result<(), UsbError> {
    hc.init()?;

    let name = hc.name();
    let irq = hc.irq_line();

    crate::arch::without_interrupts(|| {
        CORE.lock().controllers.push(ControllerSlot { hc, devices: Vec::new(), next_address: 1 });
    });

    if irq < 16 {
        crate::arch::x86_64::irq::install_handler(irq, usb_irq_handler);
    } else {
        log::error!("{}: invalid IRQ line {}", name, irq);
        return Err(UsbError::HardwareFault);
    }

    log::info!("registered {} controller", name);
    Ok(())
}

/// Register a class/vendor driver and offer it the already-enumerated,
/// unclaimed devices.
pub fn register_driver(driver: &'static dyn UsbDriver) {
    DRIVERS.lock().push(driver);
    log::info!("registered USB driver: {}", driver.name());

    let devices: Vec<DevPtr> = crate::arch::without_interrupts(|| {
        CORE.lock().controllers.iter().flat_map(|s| s.devices.iter().copied()).collect()
    });
    for dev in devices {
        // SAFETY: Devices stay live while listed.
        if unsafe { dev.as_ref().driver.is_none() } {
            match_drivers(dev);
        }
    }
}

fn enumerate_all_ports() {
    let controller_count =
        crate::arch::without_interrupts(|| CORE.lock().controllers.len());

    let mut device_count = 0;
    for slot in 0..controller_count {
        let ports = crate::arch::without_interrupts(|| {
            CORE.lock().controllers[slot].hc.num_ports()
        });
        for port in 0..ports {
            if enumerate_port(slot, port).is_ok() {
                device_count += 1;
            }
        }
    }
    log::info!("found {} USB device(s)", device_count);
}

/// Reset one port and, when a device answers, run the enumeration
/// pipeline: short descriptor read, address assignment, full descriptor,
/// configuration, driver match.
pub fn enumerate_port(slot: usize, port: u8) -> Result<DevPtr, UsbError> {
    let speed = crate::arch::without_interrupts(|| {
        let mut core = CORE.lock();
        let s = core.controllers.get_mut(slot).ok_or(UsbError::NoController)?;
        s.hc.reset_port(port).ok_or(UsbError::EnumerationFailed)
    })?;

    log::info!("device on controller {} port {} ({:?} speed)", slot, port, speed);

    // Address 0, default max packet 8 until the short descriptor answers.
    let dev = Box::new(UsbDevice {
        address: 0,
        speed,
        port,
        max_packet_size: 8,
        descriptor: DeviceDescriptor::default(),
        controller: slot,
        driver: None,
        driver_data: core::ptr::null_mut(),
        active_transfers: Vec::new(),
    });
    let dev = DevPtr(NonNull::from(Box::leak(dev)));

    crate::arch::without_interrupts(|| {
        CORE.lock().controllers[slot].devices.push(dev);
    });

    match enumerate_device(slot, dev) {
        Ok(()) => {
            match_drivers(dev);
            Ok(dev)
        }
        Err(e) => {
            log::error!("enumeration failed on port {}: {:?}", port, e);
            free_device(dev);
            Err(e)
        }
    }
}

fn enumerate_device(slot: usize, dev: DevPtr) -> Result<(), UsbError> {
    let mut desc = [0u8; 18];

    // Short read to learn bMaxPacketSize0.
    get_descriptor(dev, USB_DESC_DEVICE, 0, desc.as_mut_ptr(), 8)?;
    // SAFETY: Device is live; single-threaded enumeration.
    unsafe { dev.as_mut().max_packet_size = desc[7] as u16 };

    // Assign the next free address on this controller.
    let address = crate::arch::without_interrupts(|| {
        let mut core = CORE.lock();
        let s = &mut core.controllers[slot];
        let a = s.next_address;
        s.next_address = if s.next_address >= 127 { 1 } else { s.next_address + 1 };
        a
    });
    set_address(dev, address)?;
    // SAFETY: As above.
    unsafe { dev.as_mut().address = address };

    // Give the device time to latch the new address.
    delay_ms(2);

    get_descriptor(dev, USB_DESC_DEVICE, 0, desc.as_mut_ptr(), 18)?;
    // SAFETY: DeviceDescriptor is repr(C, packed), 18 bytes.
    unsafe {
        dev.as_mut().descriptor = core::ptr::read_unaligned(desc.as_ptr() as *const DeviceDescriptor);
        let d = dev.as_ref();
        log::info!(
            "device VID={:04x} PID={:04x} class={:02x}",
            { d.descriptor.vendor_id },
            { d.descriptor.product_id },
            d.descriptor.device_class
        );
    }

    if set_configuration(dev, 1).is_err() {
        log::warn!("failed to set configuration");
    }

    Ok(())
}

fn match_drivers(dev: DevPtr) {
    let drivers: Vec<&'static dyn UsbDriver> = DRIVERS.lock().clone();
    // SAFETY: Device is live while listed.
    let descriptor = unsafe { dev.as_ref().descriptor };

    for driver in drivers {
        if !driver.matches(&descriptor) {
            continue;
        }
        log::info!("probing driver: {}", driver.name());
        match driver.probe(dev) {
            Ok(()) => {
                // SAFETY: As above; probe ran synchronously.
                unsafe { dev.as_mut().driver = Some(driver) };
                log::info!("driver {} attached", driver.name());
                return;
            }
            Err(e) => log::warn!("driver {} declined: {:?}", driver.name(), e),
        }
    }
}

/// Remove a device from its controller list and free it.
pub fn free_device(dev: DevPtr) {
    // SAFETY: The device is live until removed below.
    let (slot, driver) = unsafe { (dev.as_ref().controller, dev.as_ref().driver) };
    if let Some(d) = driver {
        d.disconnect(dev);
    }
    crate::arch::without_interrupts(|| {
        let mut core = CORE.lock();
        if let Some(s) = core.controllers.get_mut(slot) {
            s.devices.retain(|d| *d != dev);
        }
    });
    // SAFETY: No list references the device anymore.
    unsafe { drop(Box::from_raw(dev.as_ptr())) };
}

/// Synchronous control transfer.
pub fn control_transfer(
    dev: DevPtr,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: *mut u8,
    length: u16,
) -> Result<(), UsbError> {
    let setup = SetupPacket { request_type, request, value, index, length };

    crate::arch::without_interrupts(|| {
        let mut core = CORE.lock();
        // SAFETY: Device is live; the slot index it carries was assigned at
        // allocation.
        let slot = unsafe { dev.as_ref().controller };
        let s = core.controllers.get_mut(slot).ok_or(UsbError::NoController)?;
        // SAFETY: As above.
        let dev_ref = unsafe { dev.as_ref() };
        s.hc.control_transfer(dev_ref, &setup, data)
    })
}

pub fn get_descriptor(
    dev: DevPtr,
    desc_type: u8,
    desc_index: u8,
    buffer: *mut u8,
    length: u16,
) -> Result<(), UsbError> {
    control_transfer(
        dev,
        USB_DIR_IN | USB_REQ_TYPE_STANDARD | USB_REQ_RECIPIENT_DEVICE,
        USB_REQ_GET_DESCRIPTOR,
        ((desc_type as u16) << 8) | desc_index as u16,
        0,
        buffer,
        length,
    )
}

pub fn set_address(dev: DevPtr, address: u8) -> Result<(), UsbError> {
    control_transfer(
        dev,
        USB_DIR_OUT | USB_REQ_TYPE_STANDARD | USB_REQ_RECIPIENT_DEVICE,
        USB_REQ_SET_ADDRESS,
        address as u16,
        0,
        core::ptr::null_mut(),
        0,
    )
}

pub fn set_configuration(dev: DevPtr, config: u8) -> Result<(), UsbError> {
    control_transfer(
        dev,
        USB_DIR_OUT | USB_REQ_TYPE_STANDARD | USB_REQ_RECIPIENT_DEVICE,
        USB_REQ_SET_CONFIGURATION,
        config as u16,
        0,
        core::ptr::null_mut(),
        0,
    )
}

/// Submit an asynchronous interrupt transfer; the callback fires from the
/// IRQ path when the hardware completes it.
pub fn submit_interrupt_transfer(
    dev: DevPtr,
    endpoint: u8,
    buffer: *mut u8,
    length: u16,
    callback: TransferCallback,
) -> Result<TransferPtr, UsbError> {
    let t = transfer::alloc_transfer(dev, endpoint, buffer, length, Some(callback));

    let result = crate::arch::without_interrupts(|| {
        let mut core = CORE.lock();
        // SAFETY: Device is live.
        let slot = unsafe { dev.as_ref().controller };
        let s = core.controllers.get_mut(slot).ok_or(UsbError::NoController)?;
        // SAFETY: As above; exclusive access under the lock.
        unsafe { dev.as_mut().active_transfers.push(t) };
        let dev_ref = unsafe { dev.as_ref() };
        s.hc.submit_interrupt_transfer(dev_ref, t)
    });

    match result {
        Ok(()) => Ok(t),
        Err(e) => {
            crate::arch::without_interrupts(|| {
                // SAFETY: Device is live; push above succeeded.
                unsafe { dev.as_mut().active_transfers.retain(|x| *x != t) };
            });
            // SAFETY: The controller rejected it; no tracker references it.
            unsafe { transfer::release_transfer(t) };
            Err(e)
        }
    }
}

/// Cancel a pending transfer. The callback is *not* invoked; the caller
/// observes the ERROR state through the pointer it holds and releases it.
pub fn cancel_transfer(dev: DevPtr, t: TransferPtr) -> Result<(), UsbError> {
    crate::arch::without_interrupts(|| {
        let mut core = CORE.lock();
        // SAFETY: Device is live.
        let slot = unsafe { dev.as_ref().controller };
        // SAFETY: As above.
        unsafe { dev.as_mut().active_transfers.retain(|x| *x != t) };
        let s = core.controllers.get_mut(slot).ok_or(UsbError::NoController)?;
        s.hc.cancel_transfer(t)
    })
}

/// Shared IRQ body for every registered controller.
///
/// Harvests completions under the core lock, then runs callbacks with the
/// lock released so a callback can resubmit. Completed transfers are
/// released after their callback returns.
fn usb_irq_handler() {
    let mut completed: Vec<TransferPtr> = Vec::new();

    {
        let mut core = CORE.lock();
        for slot in core.controllers.iter_mut() {
            slot.hc.handle_irq(&mut completed);
        }
    }

    for t in completed {
        // SAFETY: The controller finished this transfer and dropped its
        // tracker; the core is the sole owner now.
        unsafe {
            let tr = t.as_mut();
            let dev = tr.device;
            dev.as_mut().active_transfers.retain(|x| *x != t);
            if let Some(cb) = tr.callback {
                cb(dev, t);
            }
            transfer::release_transfer(t);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_is_18_bytes() {
        assert_eq!(core::mem::size_of::<DeviceDescriptor>(), 18);
        assert_eq!(core::mem::size_of::<SetupPacket>(), 8);
    }

    #[test]
    fn get_descriptor_request_encoding() {
        // wValue = (type << 8) | index per the USB spec.
        let value = ((USB_DESC_DEVICE as u16) << 8) | 3;
        assert_eq!(value, 0x0103);
        assert_eq!(USB_DIR_IN | USB_REQ_TYPE_STANDARD | USB_REQ_RECIPIENT_DEVICE, 0x80);
    }

    #[test]
    fn pid_tokens_match_the_wire_values() {
        assert_eq!(USB_PID_SETUP, 0x2D);
        assert_eq!(USB_PID_IN, 0x69);
        assert_eq!(USB_PID_OUT, 0xE1);
    }
}
