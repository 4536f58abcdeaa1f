#![forbid(unsafe_code)]
//! Deferred flush daemon.
//!
//! One background task per device persists data that RT mode deferred. The
//! per-device state machine:
//!
//! ```text
//! Sleep ──arm (RT request / dirty data)──▶ Standby
//! Standby ──async or sync trigger──▶ Run(kind) ──done──▶ Standby | Sleep
//! ```
//!
//! The run kind (`Normal`, `Sync`, `SysSync`) is the payload of the `Run`
//! variant, so "a run type without a running daemon" cannot be represented.
//!
//! Every flush holds a per-device token for its full duration, serializing
//! concurrent triggers. After a flush completes, the dirty state is
//! re-checked: a producer racing with the flush leaves data behind, which is
//! retried up to [`FlushConfig::max_retries`]; beyond the bound the daemon
//! logs a warning and yields — the data is still queued, so only latency is
//! lost, never durability.
//!
//! Daemons are created on first use of a device, reference-counted across
//! minors sharing it, and torn down when the last reference drops.

use parking_lot::Mutex;
use revo_error::Result;
use revo_rt::{MaintenanceHook, RtController};
use revo_types::{BoundedCounter, DeviceId, MAX_OPEN_FILES};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::{Condvar, Mutex as StdMutex};

/// What a running flush is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Background pass triggered asynchronously.
    Normal,
    /// Caller-blocking full flush.
    Sync,
    /// Caller-blocking flush restricted to filesystem metadata objects.
    SysSync,
}

/// Daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Sleep,
    Standby,
    Run(RunKind),
}

/// Which dirty objects a flush covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    All,
    /// Structural durability only; ordinary file data stays queued.
    MetadataOnly,
}

/// The dirty state a daemon drains. Implemented by the reservoir engine.
///
/// `flush` must dispatch all currently-resolvable dirty data through the
/// normal write path and wait for its completion before returning.
pub trait FlushTarget: Send + Sync {
    fn is_dirty(&self, device: DeviceId) -> bool;

    /// Returns the number of descriptors dispatched.
    fn flush(&self, device: DeviceId, scope: FlushScope) -> Result<usize>;
}

/// Daemon tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushConfig {
    /// Dirty-convergence retries per trigger before yielding.
    pub max_retries: u32,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self { max_retries: 8 }
    }
}

// ── Daemon ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DaemonState {
    state: FlushState,
    async_pending: bool,
    shutdown: bool,
}

struct DaemonShared {
    device: DeviceId,
    state: StdMutex<DaemonState>,
    trigger: Condvar,
    /// Serializes flush passes; held for the full duration of each.
    token: StdMutex<()>,
    target: Arc<dyn FlushTarget>,
    rt: Arc<RtController>,
    config: FlushConfig,
}

impl DaemonShared {
    fn set_state(&self, next: FlushState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.state != next {
            tracing::debug!(
                target: "revo::flush",
                device = self.device.0,
                from = ?state.state,
                to = ?next,
                "flush state transition"
            );
            state.state = next;
        }
        drop(state);
        self.trigger.notify_all();
    }

    /// One complete flush pass under the per-device token.
    fn run_flush(&self, kind: RunKind) -> Result<usize> {
        let _token = self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.set_state(FlushState::Run(kind));

        let scope = match kind {
            RunKind::SysSync => FlushScope::MetadataOnly,
            RunKind::Normal | RunKind::Sync => FlushScope::All,
        };

        let mut dispatched = 0_usize;
        let mut attempts = 0_u32;
        let result = loop {
            match self.target.flush(self.device, scope) {
                Ok(count) => dispatched += count,
                Err(error) => break Err(error),
            }
            // A metadata-only pass leaves file data dirty on purpose.
            if scope == FlushScope::MetadataOnly || !self.target.is_dirty(self.device) {
                break Ok(dispatched);
            }
            attempts += 1;
            if attempts >= self.config.max_retries {
                tracing::warn!(
                    target: "revo::flush",
                    device = self.device.0,
                    attempts,
                    "dirty state did not converge; yielding (data remains queued)"
                );
                std::thread::yield_now();
                break Ok(dispatched);
            }
        };

        self.settle();
        result
    }

    /// Post-flush transition: Sleep only with RT off, guard free, and
    /// nothing dirty; otherwise remain armed.
    fn settle(&self) {
        let eligible = !self.rt.is_rt(self.device)
            && self.rt.lock_count(self.device) == 0
            && !self.target.is_dirty(self.device);
        self.set_state(if eligible {
            FlushState::Sleep
        } else {
            FlushState::Standby
        });
    }

    fn worker_loop(&self) {
        loop {
            let kind = {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    if state.shutdown {
                        return;
                    }
                    if state.async_pending {
                        state.async_pending = false;
                        break;
                    }
                    state = self
                        .trigger
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                RunKind::Normal
            };
            if let Err(error) = self.run_flush(kind) {
                // Invisible to writers; data stays queued for the next pass.
                tracing::warn!(
                    target: "revo::flush",
                    device = self.device.0,
                    %error,
                    "background flush failed"
                );
            }
        }
    }
}

/// Per-device deferred flush daemon.
pub struct FlushDaemon {
    shared: Arc<DaemonShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for FlushDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushDaemon")
            .field("device", &self.shared.device.0)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl FlushDaemon {
    #[must_use]
    pub fn spawn(
        device: DeviceId,
        target: Arc<dyn FlushTarget>,
        rt: Arc<RtController>,
        config: FlushConfig,
    ) -> Self {
        let shared = Arc::new(DaemonShared {
            device,
            state: StdMutex::new(DaemonState {
                state: FlushState::Sleep,
                async_pending: false,
                shutdown: false,
            }),
            trigger: Condvar::new(),
            token: StdMutex::new(()),
            target,
            rt,
            config,
        });
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("revo-flush-{}", device.0))
                .spawn(move || shared.worker_loop())
                .ok()
        };
        if worker.is_none() {
            tracing::warn!(
                target: "revo::flush",
                device = device.0,
                "flush worker could not be spawned; async triggers degrade to sync"
            );
        }
        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    #[must_use]
    pub fn state(&self) -> FlushState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .state
    }

    /// Bring the daemon out of Sleep (RT request observed, or dirty data
    /// appeared).
    pub fn arm(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.state == FlushState::Sleep {
            state.state = FlushState::Standby;
            tracing::debug!(
                target: "revo::flush",
                device = self.shared.device.0,
                "daemon armed to standby"
            );
        }
    }

    /// Return to Sleep if nothing keeps the daemon armed.
    pub fn reevaluate_sleep(&self) {
        let standby = {
            let state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.state == FlushState::Standby
        };
        if standby {
            self.shared.settle();
        }
    }

    /// Trigger a background flush pass; returns immediately.
    pub fn request_async_flush(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.state == FlushState::Sleep {
                state.state = FlushState::Standby;
            }
            state.async_pending = true;
        }
        self.shared.trigger.notify_all();
        // No worker thread (spawn failed): degrade to an inline pass.
        if self.worker.lock().is_none() {
            let _ = self.shared.run_flush(RunKind::Normal);
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.async_pending = false;
        }
    }

    /// Caller-blocking flush. `metadata_only` restricts the pass to
    /// filesystem metadata objects (`SysSync`).
    pub fn request_sync_flush(&self, metadata_only: bool) -> Result<usize> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.state == FlushState::Sleep {
                state.state = FlushState::Standby;
            }
        }
        let kind = if metadata_only {
            RunKind::SysSync
        } else {
            RunKind::Sync
        };
        self.shared.run_flush(kind)
    }

    fn shutdown(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.shutdown = true;
        }
        self.shared.trigger.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

struct RegistryEntry {
    daemon: Arc<FlushDaemon>,
    refs: BoundedCounter,
}

/// Reference-counted daemon-per-device table.
///
/// Minor devices sharing a device class share one daemon; the daemon is
/// created on first acquire and destroyed when the last reference drops.
pub struct FlushRegistry {
    devices: Mutex<HashMap<DeviceId, RegistryEntry>>,
    target: Arc<dyn FlushTarget>,
    rt: Arc<RtController>,
    config: FlushConfig,
}

impl std::fmt::Debug for FlushRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushRegistry")
            .field("devices", &self.devices.lock().len())
            .finish_non_exhaustive()
    }
}

impl FlushRegistry {
    #[must_use]
    pub fn new(target: Arc<dyn FlushTarget>, rt: Arc<RtController>, config: FlushConfig) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            target,
            rt,
            config,
        }
    }

    /// Get (creating if needed) the daemon for a device, taking a reference.
    pub fn acquire(&self, device: DeviceId) -> Arc<FlushDaemon> {
        let mut devices = self.devices.lock();
        let entry = devices.entry(device).or_insert_with(|| {
            tracing::debug!(target: "revo::flush", device = device.0, "daemon created");
            RegistryEntry {
                daemon: Arc::new(FlushDaemon::spawn(
                    device,
                    Arc::clone(&self.target),
                    Arc::clone(&self.rt),
                    self.config,
                )),
                refs: BoundedCounter::new("flush_refs", MAX_OPEN_FILES),
            }
        });
        entry.refs.increment();
        Arc::clone(&entry.daemon)
    }

    /// Drop one reference; the last one tears the daemon down.
    pub fn release(&self, device: DeviceId) {
        let daemon = {
            let mut devices = self.devices.lock();
            let Some(entry) = devices.get_mut(&device) else {
                tracing::warn!(
                    target: "revo::flush",
                    device = device.0,
                    "release for a device with no daemon"
                );
                return;
            };
            entry.refs.decrement();
            if !entry.refs.is_zero() {
                return;
            }
            devices.remove(&device).map(|entry| entry.daemon)
        };
        if let Some(daemon) = daemon {
            tracing::debug!(target: "revo::flush", device = device.0, "daemon destroyed");
            daemon.shutdown();
        }
    }

    /// Daemon for a device if one currently exists (no reference taken).
    #[must_use]
    pub fn get(&self, device: DeviceId) -> Option<Arc<FlushDaemon>> {
        self.devices
            .lock()
            .get(&device)
            .map(|entry| Arc::clone(&entry.daemon))
    }
}

impl MaintenanceHook for FlushRegistry {
    fn arm(&self, device: DeviceId) {
        if let Some(daemon) = self.get(device) {
            daemon.arm();
        }
    }

    fn reevaluate_sleep(&self, device: DeviceId) {
        if let Some(daemon) = self.get(device) {
            daemon.reevaluate_sleep();
        }
    }
}
