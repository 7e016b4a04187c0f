//! Kernel-wide error types
//!
//! Specific variants instead of string literals; subsystems with richer
//! failure modes (frame allocator, USB, ELF) define their own enums and
//! convert into `KernelError` at the boundary.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Out of physical frames or kernel-heap virtual space.
    OutOfMemory,
    /// A virtual address that should have been mapped was not.
    UnmappedMemory { addr: u64 },
    /// An address or index outside the valid range.
    InvalidAddress { addr: u64 },
    /// Caller-supplied argument was rejected.
    InvalidArgument { name: &'static str },
    /// A fixed-capacity table or pool is full.
    ResourceExhausted { resource: &'static str },
    /// A lookup by id found nothing.
    NotFound { resource: &'static str, id: u64 },
    /// The object is in the wrong state for the operation.
    InvalidState { expected: &'static str },
    /// A device reported a failure.
    HardwareError { device: &'static str },
    /// A bounded wait elapsed.
    Timeout { operation: &'static str },
    /// Called before the owning subsystem was initialized.
    NotInitialized { subsystem: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::UnmappedMemory { addr } => {
                write!(f, "unmapped memory at {:#x}", addr)
            }
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {:#x}", addr)
            }
            KernelError::InvalidArgument { name } => {
                write!(f, "invalid argument: {}", name)
            }
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            KernelError::NotFound { resource, id } => {
                write!(f, "{} {} not found", resource, id)
            }
            KernelError::InvalidState { expected } => {
                write!(f, "invalid state, expected {}", expected)
            }
            KernelError::HardwareError { device } => {
                write!(f, "hardware error: {}", device)
            }
            KernelError::Timeout { operation } => {
                write!(f, "timeout: {}", operation)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        extern crate std;
        use std::string::ToString;

        let e = KernelError::UnmappedMemory { addr: 0x4000 };
        assert_eq!(e.to_string(), "unmapped memory at 0x4000");
    }
}
