//! USB transfer requests
//!
//! A [`Transfer`] pairs a device endpoint with a buffer and a completion
//! callback. Controllers keep internal trackers mapping hardware
//! descriptors back to these records; the IRQ path drains completions and
//! the core invokes each callback exactly once with the terminal status.
//!
//! Ownership: the core releases a transfer after its completion callback
//! returns. A cancelled transfer is never completed and never has its
//! callback invoked -- the submitter keeps the pointer and releases it.

use alloc::boxed::Box;
use core::ptr::NonNull;

use super::DevPtr;

/// Lifecycle of a transfer. Transitions are monotonic: PENDING to exactly
/// one terminal state, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Completed,
    Error,
    Stalled,
    Timeout,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

/// Completion callback, invoked from the controller IRQ path.
pub type TransferCallback = fn(DevPtr, TransferPtr);

/// An asynchronous transfer request.
pub struct Transfer {
    pub device: DevPtr,
    /// Endpoint address including the direction bit (0x80 = IN).
    pub endpoint: u8,
    pub buffer: *mut u8,
    pub length: u16,
    pub actual_length: u16,
    status: TransferStatus,
    pub callback: Option<TransferCallback>,
}

impl Transfer {
    pub fn new(
        device: DevPtr,
        endpoint: u8,
        buffer: *mut u8,
        length: u16,
        callback: Option<TransferCallback>,
    ) -> Self {
        Self {
            device,
            endpoint,
            buffer,
            length,
            actual_length: 0,
            status: TransferStatus::Pending,
            callback,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Move to a terminal state. A second terminal transition is ignored,
    /// keeping the first outcome authoritative.
    pub fn finish(&mut self, status: TransferStatus, actual_length: u16) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.actual_length = actual_length;
        true
    }
}

/// Shared pointer to a live transfer (allocated with [`alloc_transfer`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPtr(NonNull<Transfer>);

// SAFETY: Transfers are manipulated with interrupts disabled on one CPU.
unsafe impl Send for TransferPtr {}

impl TransferPtr {
    pub fn as_ptr(&self) -> *mut Transfer {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The transfer must not have been released.
    pub unsafe fn as_ref<'a>(&self) -> &'a Transfer {
        // SAFETY: Caller guarantees liveness.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// The transfer must not have been released; the caller must have
    /// exclusive access (interrupts off).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut Transfer {
        // SAFETY: Caller guarantees exclusivity.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// Allocate a transfer on the kernel heap.
pub fn alloc_transfer(
    device: DevPtr,
    endpoint: u8,
    buffer: *mut u8,
    length: u16,
    callback: Option<TransferCallback>,
) -> TransferPtr {
    let boxed = Box::new(Transfer::new(device, endpoint, buffer, length, callback));
    TransferPtr(NonNull::from(Box::leak(boxed)))
}

/// Release a transfer.
///
/// # Safety
///
/// `t` must have come from [`alloc_transfer`], must not be referenced by
/// any controller tracker, and must not be released twice.
pub unsafe fn release_transfer(t: TransferPtr) {
    // SAFETY: Caller guarantees sole ownership.
    unsafe { drop(Box::from_raw(t.as_ptr())) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn dangling_dev() -> DevPtr {
        DevPtr::dangling_for_tests()
    }

    #[test]
    fn status_is_monotonic() {
        let mut t = Transfer::new(dangling_dev(), 0x81, core::ptr::null_mut(), 8, None);
        assert_eq!(t.status(), TransferStatus::Pending);
        assert!(t.finish(TransferStatus::Completed, 8));
        assert_eq!(t.actual_length, 8);
        // A later error report cannot overwrite the completion.
        assert!(!t.finish(TransferStatus::Error, 0));
        assert_eq!(t.status(), TransferStatus::Completed);
        assert_eq!(t.actual_length, 8);
    }

    #[test]
    fn pending_is_not_a_valid_transition_target() {
        let mut t = Transfer::new(dangling_dev(), 0x81, core::ptr::null_mut(), 8, None);
        assert!(!t.finish(TransferStatus::Pending, 0));
        assert_eq!(t.status(), TransferStatus::Pending);
    }

    #[test]
    fn terminal_states_cover_the_contract() {
        for s in [
            TransferStatus::Completed,
            TransferStatus::Error,
            TransferStatus::Stalled,
            TransferStatus::Timeout,
        ] {
            assert!(s.is_terminal());
        }
        assert!(!TransferStatus::Pending.is_terminal());
    }
}
