//! Hierarchical GPU prefix sums (scan) for u32 buffers, built on wgpu.
//!
//! The engine decomposes a scan over N elements into levels of 128-element
//! workgroups, keeps every level packed in a single device allocation, and
//! plans its own dispatch arguments on the device — so the element count may
//! live in a GPU buffer the host has never read.

pub mod geometry;
pub mod gpu;
pub mod reference;

/// Error types for upsweep operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScanError {
    /// The support resources are disposed or were never allocated.
    InvalidResources,
    /// An input buffer is unusable for the requested scan (too small,
    /// or a misaligned / out-of-bounds count location).
    InvalidInput,
    /// The requested element count exceeds the reserved capacity, or the
    /// requested capacity exceeds what the device can bind.
    CapacityExceeded,
    /// The engine was used before `init()` or after `dispose()`.
    KernelNotLoaded,
    /// No usable compute device, or the operation is not supported on it.
    Unsupported,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidResources => write!(f, "support resources are not allocated"),
            Self::InvalidInput => write!(f, "invalid input buffer"),
            Self::CapacityExceeded => write!(f, "element count exceeds reserved capacity"),
            Self::KernelNotLoaded => write!(f, "scan kernels are not loaded"),
            Self::Unsupported => write!(f, "unsupported operation"),
        }
    }
}

impl std::error::Error for ScanError {}

pub type ScanResult<T> = Result<T, ScanError>;
