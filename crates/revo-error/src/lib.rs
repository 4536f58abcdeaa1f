#![forbid(unsafe_code)]
//! Error types for the revo pipeline.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Behavior |
//! |-------|----------|----------|
//! | Configuration | `InvalidGroup`, `InvalidSlot`, `InvalidStretch`, `NotRealTime`, `BudgetExceeded`, `UnknownDevice`, `UnknownFile`, `Misaligned` | Rejected synchronously, no state mutated |
//! | Allocator exhaustion | `NoSpace` | Propagated to the write/close/sync call that triggered the drain |
//! | Scratch exhaustion | `ScratchExhausted` | Logged at the call site; the triggering write fails, sibling descriptors still dispatch |
//! | Hardware | `Io`, `TransportFault` | Reported through the descriptor completion or the triggering call |
//! | Contention | `Busy` | Caller may retry |
//!
//! Placement pressure (no contiguous run available) is **not** an error:
//! the reservoir falls back to per-block placement transparently.
//!
//! ## errno Mapping
//!
//! The pipeline fronts a character-device surface, so every variant maps to
//! exactly one POSIX errno via [`RevoError::to_errno`]. The mapping is
//! exhaustive (no wildcard arms) so adding a variant is a compile error until
//! its errno is assigned.

use thiserror::Error;

/// Unified error type for all revo operations.
#[derive(Debug, Error)]
pub enum RevoError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File-group id outside the bounded group table.
    #[error("invalid file group {group}")]
    InvalidGroup { group: u16 },

    /// Reservoir slot outside the bounded per-group slot array.
    #[error("invalid reservoir slot {slot} in group {group}")]
    InvalidSlot { group: u16, slot: u16 },

    /// Stretch factor of zero or beyond the accepted maximum.
    #[error("invalid stretch factor {factor}")]
    InvalidStretch { factor: u32 },

    /// Operation requires a real-time stream (e.g. `stretch`, direct mode).
    #[error("stream is not in real-time mode")]
    NotRealTime,

    /// Stretch would exceed the workspace-wide queued-descriptor budget.
    #[error("descriptor budget exceeded: requested {requested}, budget {budget}")]
    BudgetExceeded { requested: usize, budget: usize },

    /// Allocator exhaustion: no blocks left to claim.
    #[error("no space left on device")]
    NoSpace,

    /// Scratch memory for padding/alignment could not be obtained.
    #[error("scratch pool exhausted: need {need} bytes")]
    ScratchExhausted { need: u32 },

    /// The transport refused or failed a dispatched descriptor.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// Device id outside the fixed-capacity device tables.
    #[error("unknown device {device}")]
    UnknownDevice { device: u16 },

    /// File not registered with any reservoir on this device.
    #[error("unknown file {file}")]
    UnknownFile { file: u64 },

    /// Caller range not representable against the minimum transfer unit.
    #[error("misaligned range: offset {offset} len {len}")]
    Misaligned { offset: u64, len: u64 },

    /// Transient contention (flush token held); retry later.
    #[error("device busy")]
    Busy,
}

impl RevoError {
    /// Convert this error into a POSIX errno suitable for ioctl/write replies.
    ///
    /// Exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidGroup { .. }
            | Self::InvalidSlot { .. }
            | Self::InvalidStretch { .. }
            | Self::Misaligned { .. } => libc::EINVAL,
            Self::NotRealTime => libc::EOPNOTSUPP,
            Self::BudgetExceeded { .. } | Self::ScratchExhausted { .. } => libc::ENOMEM,
            Self::NoSpace => libc::ENOSPC,
            Self::TransportFault(_) => libc::EIO,
            Self::UnknownDevice { .. } => libc::ENXIO,
            Self::UnknownFile { .. } => libc::EBADF,
            Self::Busy => libc::EAGAIN,
        }
    }
}

/// Result alias using `RevoError`.
pub type Result<T> = std::result::Result<T, RevoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RevoError, libc::c_int)> = vec![
            (RevoError::Io(std::io::Error::other("test")), libc::EIO),
            (RevoError::InvalidGroup { group: 9 }, libc::EINVAL),
            (RevoError::InvalidSlot { group: 0, slot: 99 }, libc::EINVAL),
            (RevoError::InvalidStretch { factor: 0 }, libc::EINVAL),
            (RevoError::NotRealTime, libc::EOPNOTSUPP),
            (
                RevoError::BudgetExceeded {
                    requested: 2048,
                    budget: 1024,
                },
                libc::ENOMEM,
            ),
            (RevoError::NoSpace, libc::ENOSPC),
            (RevoError::ScratchExhausted { need: 512 }, libc::ENOMEM),
            (RevoError::TransportFault("dma stall".into()), libc::EIO),
            (RevoError::UnknownDevice { device: 77 }, libc::ENXIO),
            (RevoError::UnknownFile { file: 12 }, libc::EBADF),
            (RevoError::Misaligned { offset: 3, len: 7 }, libc::EINVAL),
            (RevoError::Busy, libc::EAGAIN),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(RevoError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = RevoError::InvalidSlot { group: 1, slot: 12 };
        assert_eq!(err.to_string(), "invalid reservoir slot 12 in group 1");

        let budget = RevoError::BudgetExceeded {
            requested: 2048,
            budget: 1024,
        };
        assert!(budget.to_string().contains("2048"));

        assert_eq!(RevoError::NoSpace.to_string(), "no space left on device");
    }
}
