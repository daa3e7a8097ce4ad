//! Kernel error types
//!
//! Recoverable conditions are reported to callers through [`KernelError`];
//! broken invariants (double frame allocation, corrupted task linkage,
//! unservicable page faults) panic instead and never appear here.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    UnmappedAddress {
        addr: u32,
    },

    /// Task-related errors
    TaskNotFound {
        pid: u32,
    },
    NoSuchChild {
        pid: u32,
    },
    NoChildren,
    /// Operation would block
    WouldBlock,

    /// Generic errors
    InvalidArgument {
        name: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {requested} bytes)")
            }
            KernelError::UnmappedAddress { addr } => {
                write!(f, "address {addr:#010x} is not mapped")
            }
            KernelError::TaskNotFound { pid } => write!(f, "no task with pid {pid}"),
            KernelError::NoSuchChild { pid } => {
                write!(f, "pid {pid} is not a child of the calling task")
            }
            KernelError::NoChildren => write!(f, "task has no children to wait for"),
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {name}"),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {resource}")
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {subsystem}")
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        extern crate alloc;
        use alloc::format;

        let msg = format!(
            "{}",
            KernelError::UnmappedAddress { addr: 0xDEAD_B000 }
        );
        assert!(msg.contains("0xdeadb000"));

        let msg = format!("{}", KernelError::TaskNotFound { pid: 7 });
        assert!(msg.contains('7'));
    }
}
