#![forbid(unsafe_code)]
//! Real-time mode controller.
//!
//! Process-wide, fixed-capacity per-device state gating whether background
//! maintenance is suppressed. State machine per device:
//!
//! ```text
//! Normal ──request_rt (locks==0)──▶ RtOn
//! Normal ──request_rt (locks>0)───▶ Suspended ──unlock to 0──▶ RtOn
//! RtOn / Suspended ──clear_rt──▶ Normal
//! ```
//!
//! `Suspended` is "RT requested but blocked behind the lock guard": it always
//! resolves to `RtOn` when the guard releases, or back to `Normal` if the
//! request is withdrawn first. The lock guard is a [`BoundedCounter`]:
//! increments past the bound and decrements past zero are logged and clamped,
//! never wrapped.
//!
//! None of these operations fail. An out-of-range device id is a caller
//! contract violation: logged, no-op.
//!
//! The controller drives the flush daemon through the [`MaintenanceHook`]
//! seam (an RT request arms the daemon; clearing RT re-evaluates its sleep
//! eligibility) so this crate stays independent of the daemon
//! implementation. The hook is called with no controller lock held.

use parking_lot::{Condvar, Mutex};
use revo_types::{BoundedCounter, DeviceId, MAX_DEVICES, MAX_RT_LOCKS};
use std::sync::Arc;

/// Per-device RT mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtState {
    Normal,
    /// RT requested while the lock guard is held; promotion pending.
    Suspended,
    RtOn,
}

/// Seam to the deferred flush daemon.
pub trait MaintenanceHook: Send + Sync {
    /// An RT request was observed: bring the daemon out of SLEEP.
    fn arm(&self, device: DeviceId);

    /// RT mode cleared: the daemon may return to SLEEP if nothing is dirty.
    fn reevaluate_sleep(&self, device: DeviceId);
}

#[derive(Debug)]
struct DeviceRt {
    state: RtState,
    locks: BoundedCounter,
}

/// Process-wide RT state table.
///
/// The table lock is short (bit tests and counter updates only); the
/// maintenance hook runs outside it. Lock order: this lock is acquired
/// strictly before any reservoir lock.
pub struct RtController {
    table: Mutex<Vec<DeviceRt>>,
    promoted: Condvar,
    hook: Mutex<Option<Arc<dyn MaintenanceHook>>>,
}

impl std::fmt::Debug for RtController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtController").finish_non_exhaustive()
    }
}

impl Default for RtController {
    fn default() -> Self {
        Self::new()
    }
}

impl RtController {
    #[must_use]
    pub fn new() -> Self {
        let table = (0..MAX_DEVICES)
            .map(|_| DeviceRt {
                state: RtState::Normal,
                locks: BoundedCounter::new("rt_lock", MAX_RT_LOCKS),
            })
            .collect();
        Self {
            table: Mutex::new(table),
            promoted: Condvar::new(),
            hook: Mutex::new(None),
        }
    }

    /// Wire the flush-daemon hook. Called once at pipeline assembly.
    pub fn set_hook(&self, hook: Arc<dyn MaintenanceHook>) {
        *self.hook.lock() = Some(hook);
    }

    fn with_hook(&self, f: impl FnOnce(&dyn MaintenanceHook)) {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            f(hook.as_ref());
        }
    }

    fn valid(device: DeviceId) -> bool {
        if device.in_range() {
            return true;
        }
        tracing::warn!(
            target: "revo::rt",
            device = device.0,
            "device id outside state table; ignored"
        );
        false
    }

    /// Non-blocking RT query.
    #[must_use]
    pub fn is_rt(&self, device: DeviceId) -> bool {
        if !Self::valid(device) {
            return false;
        }
        self.table.lock()[usize::from(device.0)].state == RtState::RtOn
    }

    /// Current state (diagnostics).
    #[must_use]
    pub fn state(&self, device: DeviceId) -> RtState {
        if !Self::valid(device) {
            return RtState::Normal;
        }
        self.table.lock()[usize::from(device.0)].state
    }

    /// Lock-guard depth (diagnostics and sleep-eligibility checks).
    #[must_use]
    pub fn lock_count(&self, device: DeviceId) -> u32 {
        if !Self::valid(device) {
            return 0;
        }
        self.table.lock()[usize::from(device.0)].locks.get()
    }

    /// Request RT mode.
    ///
    /// With the guard free this engages immediately and arms the flush
    /// daemon; with the guard held the request parks in `Suspended` and
    /// promotes when the guard releases.
    pub fn request_rt(&self, device: DeviceId) {
        if !Self::valid(device) {
            return;
        }
        let engaged = {
            let mut table = self.table.lock();
            let slot = &mut table[usize::from(device.0)];
            match slot.state {
                RtState::Normal => {
                    if slot.locks.is_zero() {
                        slot.state = RtState::RtOn;
                        tracing::debug!(target: "revo::rt", device = device.0, "rt engaged");
                        true
                    } else {
                        slot.state = RtState::Suspended;
                        tracing::debug!(
                            target: "revo::rt",
                            device = device.0,
                            locks = slot.locks.get(),
                            "rt request suspended behind lock guard"
                        );
                        false
                    }
                }
                RtState::Suspended | RtState::RtOn => false,
            }
        };
        if engaged {
            self.with_hook(|hook| hook.arm(device));
            self.promoted.notify_all();
        }
    }

    /// Clear RT mode (also withdraws a suspended request). No-op on a device
    /// already in `Normal`.
    pub fn clear_rt(&self, device: DeviceId) {
        if !Self::valid(device) {
            return;
        }
        let cleared = {
            let mut table = self.table.lock();
            let slot = &mut table[usize::from(device.0)];
            match slot.state {
                RtState::Normal => false,
                RtState::Suspended | RtState::RtOn => {
                    slot.state = RtState::Normal;
                    true
                }
            }
        };
        if cleared {
            tracing::debug!(target: "revo::rt", device = device.0, "rt cleared");
            self.with_hook(|hook| hook.reevaluate_sleep(device));
            // Wake waiters so a withdrawn request resolves their wait.
            self.promoted.notify_all();
        }
    }

    /// Take the maintenance guard (e.g. before a forced flush).
    pub fn lock(&self, device: DeviceId) {
        if !Self::valid(device) {
            return;
        }
        let mut table = self.table.lock();
        table[usize::from(device.0)].locks.increment();
    }

    /// Release the maintenance guard. Releasing to zero promotes a suspended
    /// RT request and wakes its waiters.
    pub fn unlock(&self, device: DeviceId) {
        if !Self::valid(device) {
            return;
        }
        let promoted = {
            let mut table = self.table.lock();
            let slot = &mut table[usize::from(device.0)];
            slot.locks.decrement();
            if slot.locks.is_zero() && slot.state == RtState::Suspended {
                slot.state = RtState::RtOn;
                true
            } else {
                false
            }
        };
        if promoted {
            tracing::debug!(target: "revo::rt", device = device.0, "suspended rt promoted");
            self.with_hook(|hook| hook.arm(device));
            self.promoted.notify_all();
        }
    }

    /// Block until a pending RT request resolves.
    ///
    /// Returns `true` if the device ended in `RtOn`, `false` if the request
    /// was withdrawn (or the id is out of range).
    pub fn wait_rt(&self, device: DeviceId) -> bool {
        if !Self::valid(device) {
            return false;
        }
        let mut table = self.table.lock();
        loop {
            match table[usize::from(device.0)].state {
                RtState::RtOn => return true,
                RtState::Normal => return false,
                RtState::Suspended => self.promoted.wait(&mut table),
            }
        }
    }

    /// Teardown: return every device to `Normal` with a free guard.
    pub fn reset(&self) {
        let mut table = self.table.lock();
        for slot in table.iter_mut() {
            slot.state = RtState::Normal;
            while !slot.locks.is_zero() {
                slot.locks.decrement();
            }
        }
        drop(table);
        self.promoted.notify_all();
    }
}
