#![forbid(unsafe_code)]
//! Core identifiers and constants for the revo write-back pipeline.

use serde::{Deserialize, Serialize};

/// Maximum number of device classes tracked by the process-wide tables.
pub const MAX_DEVICES: usize = 8;

/// Maximum number of concurrently-live file groups (interleaved sessions).
pub const MAX_GROUPS: usize = 4;

/// Reservoir slots per file group (independent substreams).
pub const MAX_SLOTS: usize = 8;

/// Default reservoir batch depth (descriptors per placement unit).
pub const DEFAULT_TARGET_DEPTH: usize = 16;

/// Workspace-wide budget on total queued-descriptor capacity.
///
/// `stretch` requests that would push the sum of all reservoir target depths
/// past this budget are rejected.
pub const DESCRIPTOR_BUDGET: usize = 1024;

/// Largest accepted `stretch` factor.
pub const MAX_STRETCH_FACTOR: u32 = 16;

/// Entries per scatter-gather page chunk before chaining an overflow page.
pub const SG_PAGE_ENTRIES: usize = 64;

/// Bytes moved per committed logical page (the transport moves whole pages).
pub const TRANSFER_PAGE_BYTES: u32 = 64 * 1024;

/// Minimum transfer unit of the transport; read-path ranges are aligned to it.
pub const MIN_TRANSFER_UNIT: u32 = 512;

/// Saturation bound for the RT lock/unlock guard.
pub const MAX_RT_LOCKS: u32 = 255;

/// Saturation bound for per-group and per-reservoir file counters.
pub const MAX_OPEN_FILES: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Device class index into the process-wide state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl DeviceId {
    /// Whether this id indexes into the fixed-capacity tables.
    #[must_use]
    pub fn in_range(self) -> bool {
        usize::from(self.0) < MAX_DEVICES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

/// Interleaved-recording-session identifier (file group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u16);

impl GroupId {
    #[must_use]
    pub fn in_range(self) -> bool {
        usize::from(self.0) < MAX_GROUPS
    }
}

/// Reservoir slot within a file group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    #[must_use]
    pub fn in_range(self) -> bool {
        usize::from(self.0) < MAX_SLOTS
    }
}

/// Opaque completion-notification handle associated with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NotifyId(pub u64);

// ── Bounded counter ─────────────────────────────────────────────────────────

/// Reference counter with a saturating bound and a clamped floor.
///
/// Overflow and underflow are caller contract violations, not runtime
/// conditions: both are logged and clamped rather than wrapping. Used for the
/// RT lock guard and for group/reservoir file counts, which must never be
/// corrupted by an unbalanced caller.
#[derive(Debug, Clone)]
pub struct BoundedCounter {
    value: u32,
    bound: u32,
    name: &'static str,
}

impl BoundedCounter {
    #[must_use]
    pub fn new(name: &'static str, bound: u32) -> Self {
        Self {
            value: 0,
            bound,
            name,
        }
    }

    /// Increment, saturating at the bound.
    ///
    /// Returns `false` (and logs) if the counter was already at its bound and
    /// the increment was not applied.
    pub fn increment(&mut self) -> bool {
        if self.value >= self.bound {
            tracing::warn!(
                target: "revo::types",
                counter = self.name,
                bound = self.bound,
                "counter saturated; increment not applied"
            );
            return false;
        }
        self.value += 1;
        true
    }

    /// Decrement, clamping at zero.
    ///
    /// Returns `false` (and logs) on underflow; the counter stays at zero.
    pub fn decrement(&mut self) -> bool {
        if self.value == 0 {
            tracing::warn!(
                target: "revo::types",
                counter = self.name,
                "counter underflow; decrement clamped at zero"
            );
            return false;
        }
        self.value -= 1;
        true
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.value
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.value == 0
    }
}
