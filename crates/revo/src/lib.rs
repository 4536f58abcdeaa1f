#![forbid(unsafe_code)]
//! Real-time write-back pipeline facade.
//!
//! Wires the four subsystems together behind one surface:
//!
//! | Piece | Crate | Role |
//! |-------|-------|------|
//! | RT mode controller | `revo-rt` | per-device Normal/Suspended/RtOn state |
//! | Flush daemon | `revo-flush` | background persistence once RT pressure subsides |
//! | Reservoir engine | `revo-reservoir` | descriptor batching and contiguous placement |
//! | SG builders | `revo-sg` | direct-transfer page construction and aligned reads |
//!
//! A [`Pipeline`] owns one RT controller and one flush registry; devices are
//! attached with their placement and transport collaborators, and callers
//! interact through [`Stream`] handles. The RT controller's maintenance hook
//! is the flush registry, so requesting RT mode arms the device's daemon and
//! leaving it re-evaluates sleep, without either crate knowing the other.

use parking_lot::Mutex;
use revo_flush::{FlushDaemon, FlushRegistry, FlushScope, FlushTarget};
use revo_reservoir::ReservoirEngine;
use revo_rt::{MaintenanceHook, RtController};
use revo_sg::{DirectReadBuilder, DirectWriteBuilder, ScratchPool};
use revo_transport::{CompletionTracker, Descriptor};
use std::collections::HashMap;
use std::sync::Arc;

pub use revo_alloc::{BitmapAllocator, BlockAllocator, ContiguousRun};
pub use revo_error::{Result, RevoError};
pub use revo_flush::{FlushConfig, FlushState, RunKind};
pub use revo_reservoir::{ReservoirConfig, ReservoirStats};
pub use revo_rt::RtState;
pub use revo_sg::SgConfig;
pub use revo_transport::{DeferredTransport, MemTransport, Segment, Transport};
pub use revo_types::{BlockNumber, DeviceId, FileId, GroupId, NotifyId, SlotId};

// ── Configuration ───────────────────────────────────────────────────────────

/// Whole-pipeline configuration; each subsystem keeps its own knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub reservoir: ReservoirConfig,
    pub flush: FlushConfig,
    pub sg: SgConfig,
    /// Bus address of the shared scratch region.
    pub scratch_base: u64,
    pub scratch_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reservoir: ReservoirConfig::default(),
            flush: FlushConfig::default(),
            sg: SgConfig::default(),
            scratch_base: 0xF000_0000,
            scratch_bytes: 8 * 1024 * 1024,
        }
    }
}

/// How a stream is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMode {
    /// Stream belongs to a real-time capture session.
    pub real_time: bool,
    /// Peripheral-to-peripheral transfers; only legal with `real_time`.
    pub direct: bool,
}

// ── Engine table ────────────────────────────────────────────────────────────

/// Per-device engine map; doubles as the flush daemons' [`FlushTarget`].
#[derive(Default)]
struct EngineTable {
    devices: Mutex<HashMap<DeviceId, Arc<ReservoirEngine>>>,
}

impl EngineTable {
    fn get(&self, device: DeviceId) -> Option<Arc<ReservoirEngine>> {
        self.devices.lock().get(&device).cloned()
    }
}

impl FlushTarget for EngineTable {
    fn is_dirty(&self, device: DeviceId) -> bool {
        self.get(device).is_some_and(|engine| engine.is_dirty())
    }

    fn flush(&self, device: DeviceId, scope: FlushScope) -> Result<usize> {
        let Some(engine) = self.get(device) else {
            return Ok(0);
        };
        let dispatched = engine.drain_all(scope == FlushScope::MetadataOnly)?;
        engine.wait_quiescent()?;
        Ok(dispatched)
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Per-device statistics snapshot for the stats surface.
#[derive(Debug, serde::Serialize)]
pub struct PipelineStats {
    pub device: u16,
    pub rt_state: String,
    /// `None` when the device has no live flush daemon.
    pub flush_state: Option<String>,
    pub reservoir: ReservoirStats,
    pub transport: TransportCounters,
}

#[derive(Debug, serde::Serialize)]
pub struct TransportCounters {
    pub dispatched: u64,
    pub completed: u64,
    pub padding_dispatched: u64,
    pub bytes_moved: u64,
    pub hardware_errors: u64,
}

/// The assembled pipeline.
pub struct Pipeline {
    rt: Arc<RtController>,
    engines: Arc<EngineTable>,
    registry: Arc<FlushRegistry>,
    scratch: Arc<ScratchPool>,
    config: PipelineConfig,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let rt = Arc::new(RtController::new());
        let engines = Arc::new(EngineTable::default());
        let registry = Arc::new(FlushRegistry::new(
            Arc::clone(&engines) as Arc<dyn FlushTarget>,
            Arc::clone(&rt),
            config.flush,
        ));
        rt.set_hook(Arc::clone(&registry) as Arc<dyn MaintenanceHook>);
        let scratch = Arc::new(ScratchPool::new(config.scratch_base, config.scratch_bytes));
        Self {
            rt,
            engines,
            registry,
            scratch,
            config,
        }
    }

    /// Register a device with its placement and transport collaborators.
    pub fn attach_device(
        &self,
        device: DeviceId,
        allocator: Arc<dyn BlockAllocator>,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        if !device.in_range() {
            return Err(RevoError::UnknownDevice { device: device.0 });
        }
        let mut devices = self.engines.devices.lock();
        if devices.contains_key(&device) {
            return Err(RevoError::Busy);
        }
        devices.insert(
            device,
            Arc::new(ReservoirEngine::new(
                device,
                self.config.reservoir.clone(),
                allocator,
                transport,
                Arc::clone(&self.rt),
                Arc::clone(&self.scratch),
            )),
        );
        tracing::info!(target: "revo::pipeline", device = device.0, "device attached");
        Ok(())
    }

    /// Flush and unregister a device. Fails if its data cannot be persisted.
    pub fn detach_device(&self, device: DeviceId) -> Result<()> {
        let Some(engine) = self.engines.get(device) else {
            return Err(RevoError::UnknownDevice { device: device.0 });
        };
        engine.drain_all(false)?;
        engine.wait_quiescent()?;
        self.engines.devices.lock().remove(&device);
        tracing::info!(target: "revo::pipeline", device = device.0, "device detached");
        Ok(())
    }

    // ── RT mode surface ─────────────────────────────────────────────────────

    pub fn request_rt(&self, device: DeviceId) {
        self.rt.request_rt(device);
    }

    pub fn clear_rt(&self, device: DeviceId) {
        self.rt.clear_rt(device);
    }

    #[must_use]
    pub fn rt_state(&self, device: DeviceId) -> RtState {
        self.rt.state(device)
    }

    /// Hold off a pending RT promotion (critical section entry).
    pub fn rt_lock(&self, device: DeviceId) {
        self.rt.lock(device);
    }

    /// Drop one promotion hold; the last one applies a deferred promotion.
    pub fn rt_unlock(&self, device: DeviceId) {
        self.rt.unlock(device);
    }

    /// Block until a requested promotion lands; `true` if RT is on.
    pub fn wait_rt(&self, device: DeviceId) -> bool {
        self.rt.wait_rt(device)
    }

    // ── Flush surface ───────────────────────────────────────────────────────

    /// Caller-blocking flush of everything queued on a device. RT promotion
    /// is held off for the duration so the flush cannot race a mode switch.
    pub fn flush_now(&self, device: DeviceId, metadata_only: bool) -> Result<usize> {
        self.rt.lock(device);
        let daemon = self.registry.acquire(device);
        let result = daemon.request_sync_flush(metadata_only);
        self.registry.release(device);
        self.rt.unlock(device);
        daemon.reevaluate_sleep();
        result
    }

    #[must_use]
    pub fn flush_state(&self, device: DeviceId) -> Option<FlushState> {
        self.registry.get(device).map(|daemon| daemon.state())
    }

    /// Queue a filesystem-structural write. Metadata is placed one block
    /// per descriptor at flush time and is covered by metadata-only flushes.
    pub fn write_metadata(&self, device: DeviceId, runs: Vec<Segment>) -> Result<()> {
        let Some(engine) = self.engines.get(device) else {
            return Err(RevoError::UnknownDevice { device: device.0 });
        };
        engine.submit_metadata(Descriptor::new(runs));
        if let Some(daemon) = self.registry.get(device) {
            daemon.arm();
        }
        Ok(())
    }

    // ── Streams ─────────────────────────────────────────────────────────────

    /// Open a stream on an attached device, seating its file in the default
    /// reservoir (group 0, slot 0).
    pub fn open_stream(&self, device: DeviceId, file: FileId, mode: StreamMode) -> Result<Stream> {
        if mode.direct && !mode.real_time {
            return Err(RevoError::NotRealTime);
        }
        let Some(engine) = self.engines.get(device) else {
            return Err(RevoError::UnknownDevice { device: device.0 });
        };
        engine.add_file(file, GroupId(0), SlotId(0))?;
        let daemon = self.registry.acquire(device);
        tracing::debug!(
            target: "revo::pipeline",
            device = device.0,
            file = file.0,
            real_time = mode.real_time,
            direct = mode.direct,
            "stream opened"
        );
        Ok(Stream {
            device,
            file,
            mode,
            sg: self.config.sg,
            rt: Arc::clone(&self.rt),
            engine,
            daemon,
            registry: Arc::clone(&self.registry),
            scratch: Arc::clone(&self.scratch),
            writer: mode.direct.then(|| {
                Mutex::new(DirectWriteBuilder::new(
                    self.config.sg,
                    Arc::clone(&self.scratch),
                ))
            }),
            closed: false,
        })
    }

    // ── Stats ───────────────────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self, device: DeviceId) -> Option<PipelineStats> {
        let engine = self.engines.get(device)?;
        let transport = engine.transport().stats();
        Some(PipelineStats {
            device: device.0,
            rt_state: format!("{:?}", self.rt.state(device)),
            flush_state: self
                .registry
                .get(device)
                .map(|daemon| format!("{:?}", daemon.state())),
            reservoir: engine.stats(),
            transport: TransportCounters {
                dispatched: transport.dispatched,
                completed: transport.completed,
                padding_dispatched: transport.padding_dispatched,
                bytes_moved: transport.bytes_moved,
                hardware_errors: transport.hardware_errors,
            },
        })
    }
}

// ── Stream handle ───────────────────────────────────────────────────────────

/// One open file on one device.
///
/// Writes queue on the file's reservoir; direct-mode writes are first built
/// into whole transfer pages. Dropping a stream without closing it flushes
/// what it can and logs instead of surfacing errors; call
/// [`close`](Self::close) to observe them.
pub struct Stream {
    device: DeviceId,
    file: FileId,
    mode: StreamMode,
    sg: SgConfig,
    rt: Arc<RtController>,
    engine: Arc<ReservoirEngine>,
    daemon: Arc<FlushDaemon>,
    registry: Arc<FlushRegistry>,
    scratch: Arc<ScratchPool>,
    writer: Option<Mutex<DirectWriteBuilder>>,
    closed: bool,
}

impl Stream {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[must_use]
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Move this stream's file to another reservoir seat.
    pub fn set_group(&self, group: GroupId, slot: SlotId) -> Result<()> {
        self.engine.retarget(self.file, group, slot)
    }

    /// Associate a completion-notification id with the stream.
    pub fn set_file_id(&self, notify: NotifyId) -> Result<()> {
        self.engine.set_notify(self.file, notify)
    }

    /// Multiply the reservoir depth for this stream (RT only, budgeted).
    pub fn stretch_queue(&self, factor: u32) -> Result<()> {
        self.engine.stretch(self.file, factor)
    }

    /// Buffered write: queue one descriptor over the given bus runs.
    pub fn write(&self, runs: Vec<Segment>) -> Result<()> {
        self.engine.submit(self.file, Descriptor::new(runs))?;
        self.daemon.arm();
        Ok(())
    }

    /// Direct-mode write: append a raw (address, length) run. Pages that
    /// fill to capacity are queued immediately; a partial page waits for
    /// more data or [`commit`](Self::commit).
    pub fn write_direct(&self, addr: u64, len: u32) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Err(RevoError::NotRealTime);
        };
        if !self.rt.is_rt(self.device) {
            return Err(RevoError::NotRealTime);
        }
        let ready = {
            let mut writer = writer.lock();
            writer.append(addr, len);
            writer.take_ready()
        };
        for page in ready {
            self.engine.submit(self.file, page.into_descriptor())?;
        }
        self.daemon.arm();
        Ok(())
    }

    /// Seal the current partial direct-mode page (padding it to a whole
    /// page) and queue everything sealed so far.
    pub fn commit(&self) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let pages = writer.lock().commit()?;
        for page in pages {
            self.engine.submit(self.file, page.into_descriptor())?;
        }
        Ok(())
    }

    /// Direct-mode read of `len` bytes at `offset` within `block` into the
    /// given destination runs, blocking until the data is in place.
    pub fn read_direct(
        &self,
        buffers: &[Segment],
        block: BlockNumber,
        offset: u32,
        len: u32,
    ) -> Result<()> {
        if self.writer.is_none() {
            return Err(RevoError::NotRealTime);
        }
        let mut builder = DirectReadBuilder::new(self.sg, Arc::clone(&self.scratch));
        for segment in buffers {
            builder.add_buffer(segment.addr, segment.len);
        }
        let tracker = Arc::new(CompletionTracker::new());
        builder.execute(
            self.engine.transport().as_ref(),
            &tracker,
            block,
            offset,
            len,
        )
    }

    /// Flush the stream's remaining data and release its references. Blocks
    /// until everything this device dispatched has completed.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.writer.is_some() {
            self.commit()?;
        }
        self.engine.remove_file(self.file)?;
        self.registry.release(self.device);
        self.daemon.reevaluate_sleep();
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(writer) = &self.writer {
            match writer.lock().commit() {
                Ok(pages) => {
                    for page in pages {
                        if let Err(error) = self.engine.submit(self.file, page.into_descriptor()) {
                            tracing::warn!(
                                target: "revo::pipeline",
                                file = self.file.0,
                                %error,
                                "dropping stream lost a direct page"
                            );
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target: "revo::pipeline",
                        file = self.file.0,
                        %error,
                        "dropping stream could not seal its partial page"
                    );
                }
            }
        }
        if let Err(error) = self.engine.remove_file(self.file) {
            tracing::warn!(
                target: "revo::pipeline",
                file = self.file.0,
                %error,
                "dropping stream left state behind"
            );
        }
        self.registry.release(self.device);
    }
}
