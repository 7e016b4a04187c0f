//! USB HID class driver (boot-protocol keyboards and mice)
//!
//! `probe` parses the configuration descriptor for the HID interface and
//! its interrupt endpoints, then queues an init context. Contexts advance
//! one state per timer tick -- PARSE, SET_PROTOCOL, SET_IDLE, the
//! device-specific init, START_TRANSFERS -- with per-state waits and a
//! retry budget; blowing the budget tears the context and the device down.
//! Once running, the IN endpoint's completion callback diffs each boot
//! report against the previous one, pushes key events into the OS event
//! queue and resubmits itself.

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;

use super::{
    transfer::TransferPtr, DevPtr, DeviceDescriptor, TransferStatus, UsbDriver, UsbError,
    USB_CLASS_HID, USB_DESC_CONFIGURATION, USB_DESC_ENDPOINT, USB_DESC_HID, USB_DESC_INTERFACE,
    USB_DIR_IN, USB_DIR_OUT, USB_REQ_RECIPIENT_INTERFACE, USB_REQ_TYPE_CLASS,
};
use crate::events::{self, Event, KeyCode, Modifiers};
use crate::mm::kheap;

// Subclasses and protocols
pub const HID_SUBCLASS_NONE: u8 = 0x00;
pub const HID_SUBCLASS_BOOT: u8 = 0x01;
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

// Class-specific requests
pub const HID_REQ_GET_REPORT: u8 = 0x01;
pub const HID_REQ_GET_IDLE: u8 = 0x02;
pub const HID_REQ_GET_PROTOCOL: u8 = 0x03;
pub const HID_REQ_SET_REPORT: u8 = 0x09;
pub const HID_REQ_SET_IDLE: u8 = 0x0A;
pub const HID_REQ_SET_PROTOCOL: u8 = 0x0B;

// Report types
pub const HID_REPORT_INPUT: u8 = 0x01;
pub const HID_REPORT_OUTPUT: u8 = 0x02;

// Boot keyboard modifier bits
pub const HID_MOD_LEFT_CTRL: u8 = 1 << 0;
pub const HID_MOD_LEFT_SHIFT: u8 = 1 << 1;
pub const HID_MOD_LEFT_ALT: u8 = 1 << 2;
pub const HID_MOD_RIGHT_CTRL: u8 = 1 << 4;
pub const HID_MOD_RIGHT_SHIFT: u8 = 1 << 5;
pub const HID_MOD_RIGHT_ALT: u8 = 1 << 6;

/// Boot-protocol keyboard input report.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardReport {
    pub modifiers: u8,
    pub reserved: u8,
    pub keys: [u8; 6],
}

/// Boot-protocol mouse input report.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseReport {
    pub buttons: u8,
    pub x: i8,
    pub y: i8,
    pub wheel: i8,
}

/// One HID device being driven.
pub struct HidDevice {
    pub usb_dev: DevPtr,
    pub interface_num: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub country_code: u8,
    pub report_desc_length: u16,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    pub max_packet: u16,
    current_keyboard: KeyboardReport,
    last_keyboard: KeyboardReport,
    current_mouse: MouseReport,
    last_mouse: MouseReport,
    /// Single preallocated buffer the interrupt transfer reads into.
    transfer_buffer: *mut u8,
    active_transfer: Option<TransferPtr>,
    /// External input hook (devfs input node, tests).
    pub input_callback: Option<fn(&HidDevice, &[u8])>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidPtr(NonNull<HidDevice>);

// SAFETY: HID devices are mutated with interrupts disabled on one CPU.
unsafe impl Send for HidPtr {}

impl HidPtr {
    /// # Safety
    ///
    /// The device must not have been torn down.
    pub unsafe fn as_ref<'a>(&self) -> &'a HidDevice {
        // SAFETY: Caller guarantees liveness.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// As `as_ref`, plus exclusive access (interrupts off).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut HidDevice {
        // SAFETY: Caller guarantees exclusivity.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// Fields recovered from the configuration descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedInterface {
    pub interface_num: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub country_code: u8,
    pub report_desc_length: u16,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    pub max_packet: u16,
}

/// Walk a configuration descriptor and pull out the first HID interface,
/// its HID descriptor and its interrupt endpoints.
pub fn parse_config_descriptor(buf: &[u8]) -> Option<ParsedInterface> {
    if buf.len() < 4 {
        return None;
    }
    let total = usize::from(u16::from_le_bytes([buf[2], buf[3]])).min(buf.len());

    let mut parsed = ParsedInterface::default();
    let mut found_interface = false;

    let mut pos = 0;
    while pos + 2 <= total {
        let length = buf[pos] as usize;
        let dtype = buf[pos + 1];
        if length == 0 || pos + length > total {
            break;
        }

        match dtype {
            USB_DESC_INTERFACE if length >= 9 => {
                let class = buf[pos + 5];
                if class == USB_CLASS_HID {
                    parsed.interface_num = buf[pos + 2];
                    parsed.subclass = buf[pos + 6];
                    parsed.protocol = buf[pos + 7];
                    found_interface = true;
                }
            }
            USB_DESC_HID if found_interface && length >= 9 => {
                parsed.country_code = buf[pos + 4];
                parsed.report_desc_length = u16::from_le_bytes([buf[pos + 7], buf[pos + 8]]);
            }
            USB_DESC_ENDPOINT if found_interface && length >= 7 => {
                let addr = buf[pos + 2];
                let attributes = buf[pos + 3];
                let max_packet = u16::from_le_bytes([buf[pos + 4], buf[pos + 5]]);
                // Interrupt endpoints only.
                if attributes & 0x03 == 0x03 {
                    if addr & 0x80 != 0 {
                        parsed.endpoint_in = addr;
                        parsed.max_packet = max_packet;
                    } else {
                        parsed.endpoint_out = addr;
                    }
                }
            }
            _ => {}
        }
        pos += length;
    }

    if found_interface && parsed.endpoint_in != 0 {
        Some(parsed)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Init state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Parse,
    SetProtocol,
    WaitProtocol,
    SetIdle,
    WaitIdle,
    DeviceSpecific,
    WaitDevice,
    StartTransfers,
    Complete,
}

/// Where PARSE branches: boot-subclass devices get the protocol forced
/// first, everything else goes straight to SET_IDLE.
pub(crate) fn parse_branch(subclass: u8) -> InitState {
    if subclass == HID_SUBCLASS_BOOT {
        InitState::SetProtocol
    } else {
        InitState::SetIdle
    }
}

/// Total retry budget per device bring-up (ticks).
const INIT_RETRY_BUDGET: i32 = 500;
/// Wait after a class request before the next state (ticks).
const CLASS_REQUEST_WAIT: u32 = 10;
/// Wait after device-specific init (ticks).
const DEVICE_INIT_WAIT: u32 = 5;

struct InitContext {
    hid: HidPtr,
    state: InitState,
    retry_count: i32,
    wait_ticks: u32,
}

static PENDING_INITS: Mutex<Vec<InitContext>> = Mutex::new(Vec::new());

static HID_DEVICES: Mutex<Vec<HidPtr>> = Mutex::new(Vec::new());

/// Advance every pending init context by one timer tick.
///
/// Runs from the timer interrupt; the synchronous class requests issued
/// here poll the controller with interrupts off, exactly like the rest of
/// the bring-up path.
pub fn init_tick() {
    let mut pending = PENDING_INITS.lock();

    let mut i = 0;
    while i < pending.len() {
        let ctx = &mut pending[i];

        ctx.retry_count -= 1;
        if ctx.retry_count <= 0 {
            log::warn!("HID init timeout");
            let hid = ctx.hid;
            pending.remove(i);
            teardown(hid);
            continue;
        }

        if ctx.wait_ticks > 0 {
            ctx.wait_ticks -= 1;
            i += 1;
            continue;
        }

        // SAFETY: The context owns its device until removed.
        let hid_ref = unsafe { ctx.hid.as_ref() };

        match ctx.state {
            InitState::Parse => {
                log::debug!(
                    "HID protocol={} subclass={}",
                    hid_ref.protocol,
                    hid_ref.subclass
                );
                ctx.state = parse_branch(hid_ref.subclass);
            }
            InitState::SetProtocol => {
                log::debug!("HID: setting boot protocol");
                let _ = set_protocol(ctx.hid, 0);
                ctx.state = InitState::WaitProtocol;
                ctx.wait_ticks = CLASS_REQUEST_WAIT;
            }
            InitState::WaitProtocol => ctx.state = InitState::SetIdle,
            InitState::SetIdle => {
                log::debug!("HID: setting idle rate");
                let _ = set_idle(ctx.hid, 0);
                ctx.state = InitState::WaitIdle;
                ctx.wait_ticks = CLASS_REQUEST_WAIT;
            }
            InitState::WaitIdle => ctx.state = InitState::DeviceSpecific,
            InitState::DeviceSpecific => {
                let ok = match hid_ref.protocol {
                    HID_PROTOCOL_KEYBOARD => {
                        log::info!("HID: initializing keyboard");
                        keyboard_init(ctx.hid).is_ok()
                    }
                    HID_PROTOCOL_MOUSE => {
                        log::info!("HID: initializing mouse");
                        mouse_init(ctx.hid).is_ok()
                    }
                    other => {
                        log::warn!("HID: unknown protocol {}", other);
                        false
                    }
                };
                if ok {
                    ctx.state = InitState::WaitDevice;
                    ctx.wait_ticks = DEVICE_INIT_WAIT;
                } else {
                    let hid = ctx.hid;
                    pending.remove(i);
                    teardown(hid);
                    continue;
                }
            }
            InitState::WaitDevice => ctx.state = InitState::StartTransfers,
            InitState::StartTransfers => {
                log::info!("HID: starting interrupt transfers");
                if start_interrupt_transfers(ctx.hid).is_ok() {
                    log::info!("HID: device fully initialized");
                    ctx.state = InitState::Complete;
                } else {
                    log::warn!("HID: failed to start transfers");
                    let hid = ctx.hid;
                    pending.remove(i);
                    teardown(hid);
                    continue;
                }
            }
            InitState::Complete => {
                pending.remove(i);
                continue;
            }
        }

        i += 1;
    }
}

/// Free everything a half-initialized device holds.
fn teardown(hid: HidPtr) {
    // SAFETY: The context queue no longer references this device; the
    // registry entry is removed below before the memory is freed.
    unsafe {
        let h = hid.as_mut();
        if let Some(t) = h.active_transfer.take() {
            let _ = super::cancel_transfer(h.usb_dev, t);
            super::transfer::release_transfer(t);
        }
        if !h.transfer_buffer.is_null() {
            kheap::kfree(h.transfer_buffer);
            h.transfer_buffer = core::ptr::null_mut();
        }
        HID_DEVICES.lock().retain(|d| *d != hid);
        h.usb_dev.as_mut().driver_data = core::ptr::null_mut();
        drop(Box::from_raw(hid.0.as_ptr()));
    }
}

// ---------------------------------------------------------------------------
// Class requests
// ---------------------------------------------------------------------------

pub fn set_protocol(hid: HidPtr, protocol: u8) -> Result<(), UsbError> {
    // SAFETY: Callers hold a live device.
    let h = unsafe { hid.as_ref() };
    super::control_transfer(
        h.usb_dev,
        USB_DIR_OUT | USB_REQ_TYPE_CLASS | USB_REQ_RECIPIENT_INTERFACE,
        HID_REQ_SET_PROTOCOL,
        protocol as u16,
        h.interface_num as u16,
        core::ptr::null_mut(),
        0,
    )
}

pub fn set_idle(hid: HidPtr, duration: u8) -> Result<(), UsbError> {
    // SAFETY: Callers hold a live device.
    let h = unsafe { hid.as_ref() };
    super::control_transfer(
        h.usb_dev,
        USB_DIR_OUT | USB_REQ_TYPE_CLASS | USB_REQ_RECIPIENT_INTERFACE,
        HID_REQ_SET_IDLE,
        (duration as u16) << 8,
        h.interface_num as u16,
        core::ptr::null_mut(),
        0,
    )
}

pub fn get_report(
    hid: HidPtr,
    report_type: u8,
    report_id: u8,
    buffer: *mut u8,
    length: u16,
) -> Result<(), UsbError> {
    // SAFETY: Callers hold a live device.
    let h = unsafe { hid.as_ref() };
    super::control_transfer(
        h.usb_dev,
        USB_DIR_IN | USB_REQ_TYPE_CLASS | USB_REQ_RECIPIENT_INTERFACE,
        HID_REQ_GET_REPORT,
        ((report_type as u16) << 8) | report_id as u16,
        h.interface_num as u16,
        buffer,
        length,
    )
}

pub fn set_report(
    hid: HidPtr,
    report_type: u8,
    report_id: u8,
    buffer: *mut u8,
    length: u16,
) -> Result<(), UsbError> {
    // SAFETY: Callers hold a live device.
    let h = unsafe { hid.as_ref() };
    super::control_transfer(
        h.usb_dev,
        USB_DIR_OUT | USB_REQ_TYPE_CLASS | USB_REQ_RECIPIENT_INTERFACE,
        HID_REQ_SET_REPORT,
        ((report_type as u16) << 8) | report_id as u16,
        h.interface_num as u16,
        buffer,
        length,
    )
}

// ---------------------------------------------------------------------------
// Device-specific bring-up
// ---------------------------------------------------------------------------

fn keyboard_init(hid: HidPtr) -> Result<(), UsbError> {
    // SAFETY: Init context holds a live device; interrupts off in the tick.
    let h = unsafe { hid.as_mut() };
    h.current_keyboard = KeyboardReport::default();
    h.last_keyboard = KeyboardReport::default();

    h.transfer_buffer = kheap::kmalloc(core::mem::size_of::<KeyboardReport>());
    if h.transfer_buffer.is_null() {
        return Err(UsbError::NoMemory);
    }
    // SAFETY: Fresh allocation of report size.
    unsafe {
        core::ptr::write_bytes(h.transfer_buffer, 0, core::mem::size_of::<KeyboardReport>())
    };

    // All LEDs off.
    let mut led_report: u8 = 0;
    let _ = set_report(hid, HID_REPORT_OUTPUT, 0, &mut led_report, 1);

    log::info!("HID: keyboard ready for input");
    Ok(())
}

fn mouse_init(hid: HidPtr) -> Result<(), UsbError> {
    // SAFETY: As in keyboard_init.
    let h = unsafe { hid.as_mut() };
    h.current_mouse = MouseReport::default();
    h.last_mouse = MouseReport::default();

    h.transfer_buffer = kheap::kmalloc(core::mem::size_of::<MouseReport>());
    if h.transfer_buffer.is_null() {
        return Err(UsbError::NoMemory);
    }
    // SAFETY: Fresh allocation of report size.
    unsafe { core::ptr::write_bytes(h.transfer_buffer, 0, core::mem::size_of::<MouseReport>()) };

    log::info!("HID: mouse ready for input");
    Ok(())
}

fn start_interrupt_transfers(hid: HidPtr) -> Result<(), UsbError> {
    // SAFETY: Init context holds a live device.
    let h = unsafe { hid.as_mut() };
    if h.transfer_buffer.is_null() {
        return Err(UsbError::NoMemory);
    }
    let report_len = match h.protocol {
        HID_PROTOCOL_KEYBOARD => core::mem::size_of::<KeyboardReport>() as u16,
        _ => core::mem::size_of::<MouseReport>() as u16,
    };
    let t = super::submit_interrupt_transfer(
        h.usb_dev,
        h.endpoint_in,
        h.transfer_buffer,
        report_len.min(h.max_packet.max(report_len)),
        interrupt_callback,
    )?;
    h.active_transfer = Some(t);
    Ok(())
}

// ---------------------------------------------------------------------------
// Input pipeline
// ---------------------------------------------------------------------------

/// Modifier byte of the boot report -> event modifier flags.
pub(crate) fn event_modifiers(report_modifiers: u8) -> Modifiers {
    let mut m = Modifiers::empty();
    if report_modifiers & (HID_MOD_LEFT_SHIFT | HID_MOD_RIGHT_SHIFT) != 0 {
        m |= Modifiers::SHIFT;
    }
    if report_modifiers & (HID_MOD_LEFT_CTRL | HID_MOD_RIGHT_CTRL) != 0 {
        m |= Modifiers::CTRL;
    }
    if report_modifiers & (HID_MOD_LEFT_ALT | HID_MOD_RIGHT_ALT) != 0 {
        m |= Modifiers::ALT;
    }
    m
}

/// Report-diff: invoke `pressed`/`released` for every key that appeared in
/// or vanished from the 6-slot array.
pub(crate) fn diff_keyboard_reports(
    prev: &KeyboardReport,
    new: &KeyboardReport,
    mut pressed: impl FnMut(u8),
    mut released: impl FnMut(u8),
) {
    for &key in new.keys.iter() {
        if key != 0 && !prev.keys.contains(&key) {
            pressed(key);
        }
    }
    for &key in prev.keys.iter() {
        if key != 0 && !new.keys.contains(&key) {
            released(key);
        }
    }
}

/// Completion callback for the IN endpoint: diff, publish, resubmit.
fn interrupt_callback(dev: DevPtr, transfer: TransferPtr) {
    // SAFETY: The device is live; driver_data points at our HidDevice
    // until disconnect, which cancels the transfer first.
    let hid_raw = unsafe { dev.as_ref().driver_data } as *mut HidDevice;
    let Some(hid_nn) = NonNull::new(hid_raw) else {
        return;
    };
    let hid = HidPtr(hid_nn);
    // SAFETY: As above; interrupts are off in the IRQ path.
    let h = unsafe { hid.as_mut() };

    // SAFETY: The transfer is live until the core releases it after this
    // callback returns.
    let (status, buffer) = unsafe {
        let t = transfer.as_ref();
        (t.status(), t.buffer)
    };

    if status != TransferStatus::Completed {
        log::debug!("HID: transfer error ({:?}), resubmitting", status);
        resubmit(hid);
        return;
    }

    match h.protocol {
        HID_PROTOCOL_KEYBOARD => {
            // SAFETY: The buffer is the preallocated report-sized buffer.
            let report = unsafe { core::ptr::read_unaligned(buffer as *const KeyboardReport) };
            if report != h.last_keyboard {
                h.current_keyboard = report;
                process_keyboard_report(h, &report);
                h.last_keyboard = report;
            }
        }
        HID_PROTOCOL_MOUSE => {
            // SAFETY: As above.
            let report = unsafe { core::ptr::read_unaligned(buffer as *const MouseReport) };
            if report != h.last_mouse {
                h.current_mouse = report;
                h.last_mouse = report;
            }
        }
        _ => {}
    }

    if let Some(cb) = h.input_callback {
        // SAFETY: The buffer holds the freshly received report bytes.
        let bytes = unsafe {
            core::slice::from_raw_parts(buffer, core::mem::size_of::<KeyboardReport>())
        };
        cb(h, bytes);
    }

    resubmit(hid);
}

fn resubmit(hid: HidPtr) {
    // SAFETY: The callback path holds a live device.
    let h = unsafe { hid.as_mut() };
    let report_len = match h.protocol {
        HID_PROTOCOL_KEYBOARD => core::mem::size_of::<KeyboardReport>() as u16,
        _ => core::mem::size_of::<MouseReport>() as u16,
    };
    match super::submit_interrupt_transfer(
        h.usb_dev,
        h.endpoint_in,
        h.transfer_buffer,
        report_len,
        interrupt_callback,
    ) {
        Ok(t) => h.active_transfer = Some(t),
        Err(e) => {
            h.active_transfer = None;
            log::warn!("HID: resubmit failed: {:?}", e);
        }
    }
}

/// Turn a changed keyboard report into key-pressed/key-released events on
/// the OS event queue.
fn process_keyboard_report(h: &HidDevice, report: &KeyboardReport) {
    let modifiers = event_modifiers(report.modifiers);
    diff_keyboard_reports(
        &h.last_keyboard,
        report,
        |key| {
            let keycode = usage_to_keycode(key);
            let ascii = keycode_to_ascii(key, report.modifiers);
            events::push(Event::key_pressed(keycode, key, ascii, modifiers));
        },
        |key| {
            let keycode = usage_to_keycode(key);
            events::push(Event::key_released(keycode, key, modifiers));
        },
    );
}

// ---------------------------------------------------------------------------
// Keycode tables
// ---------------------------------------------------------------------------

/// Boot-keyboard usage id -> ASCII, honoring shift.
pub fn keycode_to_ascii(usage: u8, modifiers: u8) -> u8 {
    let shift = modifiers & (HID_MOD_LEFT_SHIFT | HID_MOD_RIGHT_SHIFT) != 0;

    // Letters (0x04..=0x1D).
    if (0x04..=0x1D).contains(&usage) {
        let base = if shift { b'A' } else { b'a' };
        return base + (usage - 0x04);
    }
    // Digits 1..9 (0x1E..=0x26).
    if (0x1E..=0x26).contains(&usage) {
        if !shift {
            return b'1' + (usage - 0x1E);
        }
        return b"!@#$%^&*("[(usage - 0x1E) as usize];
    }
    if usage == 0x27 {
        return if shift { b')' } else { b'0' };
    }

    match usage {
        0x28 => b'\n',
        0x2A => 0x08, // backspace
        0x2B => b'\t',
        0x2C => b' ',
        0x2D => {
            if shift {
                b'_'
            } else {
                b'-'
            }
        }
        0x2E => {
            if shift {
                b'+'
            } else {
                b'='
            }
        }
        0x2F => {
            if shift {
                b'{'
            } else {
                b'['
            }
        }
        0x30 => {
            if shift {
                b'}'
            } else {
                b']'
            }
        }
        0x31 => {
            if shift {
                b'|'
            } else {
                b'\\'
            }
        }
        0x33 => {
            if shift {
                b':'
            } else {
                b';'
            }
        }
        0x34 => {
            if shift {
                b'"'
            } else {
                b'\''
            }
        }
        0x35 => {
            if shift {
                b'~'
            } else {
                b'`'
            }
        }
        0x36 => {
            if shift {
                b'<'
            } else {
                b','
            }
        }
        0x37 => {
            if shift {
                b'>'
            } else {
                b'.'
            }
        }
        0x38 => {
            if shift {
                b'?'
            } else {
                b'/'
            }
        }
        _ => 0,
    }
}

/// Boot-keyboard usage id -> virtual key code.
pub fn usage_to_keycode(usage: u8) -> KeyCode {
    match usage {
        0x29 => KeyCode::Escape,
        0x2A => KeyCode::Backspace,
        0x2B => KeyCode::Tab,
        0x28 => KeyCode::Enter,
        0x2C => KeyCode::Space,
        0x39 => KeyCode::CapsLock,
        0x3A => KeyCode::F1,
        0x3B => KeyCode::F2,
        0x3C => KeyCode::F3,
        0x3D => KeyCode::F4,
        0x3E => KeyCode::F5,
        0x3F => KeyCode::F6,
        0x40 => KeyCode::F7,
        0x41 => KeyCode::F8,
        0x42 => KeyCode::F9,
        0x43 => KeyCode::F10,
        0x44 => KeyCode::F11,
        0x45 => KeyCode::F12,
        0x47 => KeyCode::ScrollLock,
        0x49 => KeyCode::Insert,
        0x4A => KeyCode::Home,
        0x4B => KeyCode::PageUp,
        0x4C => KeyCode::Delete,
        0x4D => KeyCode::End,
        0x4E => KeyCode::PageDown,
        0x4F => KeyCode::ArrowRight,
        0x50 => KeyCode::ArrowLeft,
        0x51 => KeyCode::ArrowDown,
        0x52 => KeyCode::ArrowUp,
        0x53 => KeyCode::NumLock,
        u if (0x04..=0x38).contains(&u) => KeyCode::Char,
        _ => KeyCode::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Driver registration
// ---------------------------------------------------------------------------

struct HidUsbDriver;

impl UsbDriver for HidUsbDriver {
    fn name(&self) -> &'static str {
        "USB HID"
    }

    fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.device_class == USB_CLASS_HID
    }

    fn probe(&self, dev: DevPtr) -> Result<(), UsbError> {
        log::info!("HID: probing device");

        let mut config = [0u8; 256];
        super::get_descriptor(
            dev,
            USB_DESC_CONFIGURATION,
            0,
            config.as_mut_ptr(),
            config.len() as u16,
        )?;

        let parsed = parse_config_descriptor(&config).ok_or(UsbError::EnumerationFailed)?;
        log::info!(
            "HID interface {}: subclass={} protocol={} in=0x{:02x} max_packet={}",
            parsed.interface_num,
            parsed.subclass,
            parsed.protocol,
            parsed.endpoint_in,
            parsed.max_packet
        );

        let hid = Box::new(HidDevice {
            usb_dev: dev,
            interface_num: parsed.interface_num,
            subclass: parsed.subclass,
            protocol: parsed.protocol,
            country_code: parsed.country_code,
            report_desc_length: parsed.report_desc_length,
            endpoint_in: parsed.endpoint_in,
            endpoint_out: parsed.endpoint_out,
            max_packet: parsed.max_packet,
            current_keyboard: KeyboardReport::default(),
            last_keyboard: KeyboardReport::default(),
            current_mouse: MouseReport::default(),
            last_mouse: MouseReport::default(),
            transfer_buffer: core::ptr::null_mut(),
            active_transfer: None,
            input_callback: None,
        });
        let hid = HidPtr(NonNull::from(Box::leak(hid)));

        crate::arch::without_interrupts(|| {
            HID_DEVICES.lock().push(hid);
            // SAFETY: The device is live during probe.
            unsafe { dev.as_mut().driver_data = hid.0.as_ptr() as *mut () };
            PENDING_INITS.lock().push(InitContext {
                hid,
                state: InitState::Parse,
                retry_count: INIT_RETRY_BUDGET,
                wait_ticks: 0,
            });
        });

        log::info!("HID: probe queued for async init");
        Ok(())
    }

    fn disconnect(&self, dev: DevPtr) {
        // SAFETY: The device is live during disconnect.
        let hid_raw = unsafe { dev.as_ref().driver_data } as *mut HidDevice;
        let Some(hid_nn) = NonNull::new(hid_raw) else {
            return;
        };
        log::info!("HID: disconnecting device");
        crate::arch::without_interrupts(|| {
            let hid = HidPtr(hid_nn);
            PENDING_INITS.lock().retain(|c| c.hid != hid);
            teardown(hid);
        });
    }
}

static HID_DRIVER: HidUsbDriver = HidUsbDriver;

/// Register the HID class driver with the USB core.
pub fn init() {
    log::info!("initializing HID subsystem");
    super::register_driver(&HID_DRIVER);
}

/// Number of live HID devices (diagnostics).
pub fn device_count() -> usize {
    crate::arch::without_interrupts(|| HID_DEVICES.lock().len())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    /// Config descriptor for a boot keyboard: configuration, interface,
    /// HID descriptor, one interrupt IN endpoint.
    fn boot_keyboard_config() -> Vec<u8> {
        let mut d = Vec::new();
        // Configuration descriptor (9 bytes), wTotalLength patched below.
        d.extend_from_slice(&[9, 0x02, 0, 0, 1, 1, 0, 0xA0, 50]);
        // Interface: number 0, class HID (3), subclass boot (1), kbd (1).
        d.extend_from_slice(&[9, 0x04, 0, 0, 1, 3, 1, 1, 0]);
        // HID descriptor: bcdHID 1.11, country 0, 1 report desc, len 65.
        d.extend_from_slice(&[9, 0x21, 0x11, 0x01, 0, 1, 0x22, 65, 0]);
        // Endpoint: 0x81 IN, interrupt, max packet 8, interval 10.
        d.extend_from_slice(&[7, 0x05, 0x81, 0x03, 8, 0, 10]);
        let total = d.len() as u16;
        d[2..4].copy_from_slice(&total.to_le_bytes());
        d
    }

    #[test]
    fn parses_a_boot_keyboard_configuration() {
        let parsed = parse_config_descriptor(&boot_keyboard_config()).expect("parse");
        assert_eq!(parsed.interface_num, 0);
        assert_eq!(parsed.subclass, HID_SUBCLASS_BOOT);
        assert_eq!(parsed.protocol, HID_PROTOCOL_KEYBOARD);
        assert_eq!(parsed.endpoint_in, 0x81);
        assert_eq!(parsed.max_packet, 8);
        assert_eq!(parsed.report_desc_length, 65);
        assert_eq!(parsed.country_code, 0);
    }

    #[test]
    fn rejects_configs_without_hid_interface_or_in_endpoint() {
        // A hub interface (class 9) only.
        let mut d = Vec::new();
        d.extend_from_slice(&[9, 0x02, 0, 0, 1, 1, 0, 0xA0, 50]);
        d.extend_from_slice(&[9, 0x04, 0, 0, 1, 9, 0, 0, 0]);
        let total = d.len() as u16;
        d[2..4].copy_from_slice(&total.to_le_bytes());
        assert!(parse_config_descriptor(&d).is_none());

        // HID interface but no interrupt IN endpoint.
        let mut d = Vec::new();
        d.extend_from_slice(&[9, 0x02, 0, 0, 1, 1, 0, 0xA0, 50]);
        d.extend_from_slice(&[9, 0x04, 0, 0, 1, 3, 1, 1, 0]);
        let total = d.len() as u16;
        d[2..4].copy_from_slice(&total.to_le_bytes());
        assert!(parse_config_descriptor(&d).is_none());
    }

    #[test]
    fn parse_branch_follows_the_subclass() {
        assert_eq!(parse_branch(HID_SUBCLASS_BOOT), InitState::SetProtocol);
        assert_eq!(parse_branch(HID_SUBCLASS_NONE), InitState::SetIdle);
    }

    #[test]
    fn report_diff_finds_presses_and_releases() {
        let prev = KeyboardReport { modifiers: 0, reserved: 0, keys: [0x04, 0x05, 0, 0, 0, 0] };
        let new = KeyboardReport { modifiers: 0, reserved: 0, keys: [0x05, 0x06, 0, 0, 0, 0] };

        let mut pressed = Vec::new();
        let mut released = Vec::new();
        diff_keyboard_reports(&prev, &new, |k| pressed.push(k), |k| released.push(k));

        assert_eq!(pressed, [0x06]);
        assert_eq!(released, [0x04]);
    }

    #[test]
    fn identical_reports_produce_no_events() {
        let r = KeyboardReport { modifiers: 0, reserved: 0, keys: [0x04, 0, 0, 0, 0, 0] };
        let mut count = 0;
        diff_keyboard_reports(&r, &r, |_| count += 1, |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn ascii_translation_honors_shift() {
        assert_eq!(keycode_to_ascii(0x04, 0), b'a');
        assert_eq!(keycode_to_ascii(0x04, HID_MOD_LEFT_SHIFT), b'A');
        assert_eq!(keycode_to_ascii(0x1E, 0), b'1');
        assert_eq!(keycode_to_ascii(0x1E, HID_MOD_RIGHT_SHIFT), b'!');
        assert_eq!(keycode_to_ascii(0x27, 0), b'0');
        assert_eq!(keycode_to_ascii(0x27, HID_MOD_LEFT_SHIFT), b')');
        assert_eq!(keycode_to_ascii(0x2C, 0), b' ');
        assert_eq!(keycode_to_ascii(0x38, HID_MOD_LEFT_SHIFT), b'?');
        assert_eq!(keycode_to_ascii(0x72, 0), 0); // F23: not printable
    }

    #[test]
    fn usage_mapping_covers_specials() {
        assert_eq!(usage_to_keycode(0x29), KeyCode::Escape);
        assert_eq!(usage_to_keycode(0x52), KeyCode::ArrowUp);
        assert_eq!(usage_to_keycode(0x04), KeyCode::Char);
        assert_eq!(usage_to_keycode(0xE8), KeyCode::Unknown);
    }

    #[test]
    fn modifier_translation() {
        assert_eq!(event_modifiers(HID_MOD_LEFT_SHIFT), Modifiers::SHIFT);
        assert_eq!(
            event_modifiers(HID_MOD_RIGHT_CTRL | HID_MOD_LEFT_ALT),
            Modifiers::CTRL | Modifiers::ALT
        );
        assert_eq!(event_modifiers(0), Modifiers::empty());
    }
}
