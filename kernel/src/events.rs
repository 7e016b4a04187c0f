//! Input event queue
//!
//! A fixed 64-entry ring shared by input producers (the USB HID pipeline
//! here; PS/2 and others live outside the core) and consumers (the `input`
//! syscall, shell, external devfs nodes). Push never blocks; a full queue
//! drops the event.

use spin::Mutex;

pub const EVENT_QUEUE_SIZE: usize = 64;

/// Event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventType {
    None = 0,
    KeyPressed = 1,
    KeyReleased = 2,
    CharInput = 3,
    MouseMove = 4,
    MouseButton = 5,
}

/// Virtual key codes for non-printable keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyCode {
    Unknown = 0,
    Escape,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    Backspace,
    Tab,
    Enter,
    LeftShift,
    RightShift,
    LeftCtrl,
    RightCtrl,
    LeftAlt,
    RightAlt,
    CapsLock,
    NumLock,
    ScrollLock,
    Space,
    Insert,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    /// A printable key; the `ascii` field carries the character.
    Char,
}

bitflags::bitflags! {
    /// Modifier state carried with every key event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u8 {
        const SHIFT = 1 << 0;
        const CTRL = 1 << 1;
        const ALT = 1 << 2;
        const CAPS = 1 << 3;
        const NUM = 1 << 4;
    }
}

/// One input event. `repr(C)` so the `input` syscall can copy it to user
/// memory byte-for-byte.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Event {
    pub kind: EventType,
    /// Ticks since boot when the event was produced.
    pub timestamp: u64,
    pub keycode: KeyCode,
    /// Raw scancode / HID usage id.
    pub scancode: u8,
    /// ASCII character, 0 when not printable.
    pub ascii: u8,
    pub modifiers: Modifiers,
}

impl Event {
    pub const fn empty() -> Self {
        Self {
            kind: EventType::None,
            timestamp: 0,
            keycode: KeyCode::Unknown,
            scancode: 0,
            ascii: 0,
            modifiers: Modifiers::empty(),
        }
    }

    pub fn key_pressed(keycode: KeyCode, scancode: u8, ascii: u8, modifiers: Modifiers) -> Self {
        Self {
            kind: EventType::KeyPressed,
            timestamp: crate::arch::x86_64::timer::get_ticks(),
            keycode,
            scancode,
            ascii,
            modifiers,
        }
    }

    pub fn key_released(keycode: KeyCode, scancode: u8, modifiers: Modifiers) -> Self {
        Self {
            kind: EventType::KeyReleased,
            timestamp: crate::arch::x86_64::timer::get_ticks(),
            keycode,
            scancode,
            ascii: 0,
            modifiers,
        }
    }
}

struct EventQueue {
    events: [Event; EVENT_QUEUE_SIZE],
    read: usize,
    write: usize,
    count: usize,
}

static QUEUE: Mutex<EventQueue> = Mutex::new(EventQueue {
    events: [Event::empty(); EVENT_QUEUE_SIZE],
    read: 0,
    write: 0,
    count: 0,
});

/// Queue an event; false when the queue is full (event dropped).
pub fn push(event: Event) -> bool {
    crate::arch::without_interrupts(|| {
        let mut q = QUEUE.lock();
        if q.count == EVENT_QUEUE_SIZE {
            return false;
        }
        let w = q.write;
        q.events[w] = event;
        q.write = (w + 1) % EVENT_QUEUE_SIZE;
        q.count += 1;
        true
    })
}

/// Non-blocking poll.
pub fn poll() -> Option<Event> {
    crate::arch::without_interrupts(|| {
        let mut q = QUEUE.lock();
        if q.count == 0 {
            return None;
        }
        let e = q.events[q.read];
        q.read = (q.read + 1) % EVENT_QUEUE_SIZE;
        q.count -= 1;
        Some(e)
    })
}

pub fn pending() -> bool {
    crate::arch::without_interrupts(|| QUEUE.lock().count > 0)
}

pub fn clear() {
    crate::arch::without_interrupts(|| {
        let mut q = QUEUE.lock();
        q.read = 0;
        q.write = 0;
        q.count = 0;
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn key(scancode: u8) -> Event {
        Event::key_pressed(KeyCode::Char, scancode, b'a', Modifiers::empty())
    }

    // One test drives the shared queue end to end; splitting it would race
    // against the parallel test harness.
    #[test]
    fn fifo_order_wraparound_and_pending() {
        clear();
        assert!(!pending());

        for i in 0..EVENT_QUEUE_SIZE {
            assert!(push(key(i as u8)));
        }
        assert!(pending());
        // Full queue drops.
        assert!(!push(key(0xFF)));

        for i in 0..EVENT_QUEUE_SIZE {
            let e = poll().expect("queued event");
            assert_eq!(e.scancode, i as u8);
        }
        assert!(poll().is_none());
        assert!(!pending());

        // After draining, the ring wraps cleanly.
        assert!(push(key(0x42)));
        assert_eq!(poll().map(|e| e.scancode), Some(0x42));
        clear();
    }
}
