#![forbid(unsafe_code)]
//! Write-back reservoir: per-substream descriptor batching and placement.
//!
//! Writes do not reach media one descriptor at a time. Each open file is
//! seated in a reservoir (one per group/slot pair); the reservoir queues the
//! file's transfer descriptors until a full placement unit accumulates, then
//! claims one contiguous run of blocks and dispatches the whole batch in
//! submission order. Sequential placement is what keeps a real-time stream's
//! media layout streamable back at capture rate.
//!
//! ## Drain rules
//!
//! | Trigger | Unit claimed | Tail |
//! |---------|--------------|------|
//! | Capacity (queue reaches target depth) | one contiguous run of `target_depth` blocks | none (unit exactly full) |
//! | Release (last file leaves the reservoir) | one contiguous run of `target_depth` blocks | padded with scratch filler |
//! | Flush (daemon empties dirty reservoirs) | same as release | padded with scratch filler |
//!
//! The contiguous claim is all-or-nothing: either the whole unit is placed
//! before the first dispatch, or the drain falls back to claiming single
//! blocks one descriptor at a time (no padding on the fallback path --
//! fallback claims are exact). Placement pressure is not an error; allocator
//! exhaustion is, and it surfaces to the caller that triggered the drain.
//!
//! ## Locking
//!
//! One engine lock covers the group table, the seats, and every queue.
//! Real-time state is consulted *before* taking the engine lock, never
//! after. Completion callbacks only touch the completion tracker, so they
//! are safe in completion context and cannot deadlock against a drain.

use parking_lot::Mutex;
use revo_alloc::{BlockAllocator, ContiguousRun};
use revo_error::{Result, RevoError};
use revo_rt::RtController;
use revo_sg::ScratchPool;
use revo_transport::{Completion, CompletionTracker, Descriptor, Transport};
use revo_types::{
    BoundedCounter, DeviceId, FileId, GroupId, NotifyId, SlotId, DEFAULT_TARGET_DEPTH,
    DESCRIPTOR_BUDGET, MAX_GROUPS, MAX_OPEN_FILES, MAX_SLOTS, MAX_STRETCH_FACTOR,
    TRANSFER_PAGE_BYTES,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// ── Configuration ───────────────────────────────────────────────────────────

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct ReservoirConfig {
    /// Descriptors per placement unit before a capacity drain fires.
    pub target_depth: usize,
    /// Device-wide cap on the sum of all reservoirs' target depths.
    pub descriptor_budget: usize,
    /// Byte length of one block, used to size padding descriptors.
    pub block_bytes: u32,
    /// Contiguous-claim attempts (with a yield between) before the
    /// per-block fallback.
    pub claim_retries: u32,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            target_depth: DEFAULT_TARGET_DEPTH,
            descriptor_budget: DESCRIPTOR_BUDGET,
            block_bytes: TRANSFER_PAGE_BYTES,
            claim_retries: 4,
        }
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// Counters exported through the stats surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReservoirStats {
    pub submitted: u64,
    pub drains: u64,
    pub contiguous_drains: u64,
    pub fallback_drains: u64,
    pub dispatched: u64,
    pub padding_dispatched: u64,
    pub metadata_dispatched: u64,
    pub stretch_rejects: u64,
    pub retargets: u64,
}

// ── Internal state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum DrainReason {
    Capacity,
    Release,
    Flush,
}

struct Reservoir {
    queue: VecDeque<Descriptor>,
    /// Depth before any stretch was applied.
    base_depth: usize,
    target_depth: usize,
    files: BoundedCounter,
}

impl Reservoir {
    fn new(depth: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(depth),
            base_depth: depth,
            target_depth: depth,
            files: BoundedCounter::new("reservoir.files", MAX_OPEN_FILES),
        }
    }
}

struct FileGroup {
    id: GroupId,
    slots: Vec<Option<Reservoir>>,
    open_files: BoundedCounter,
}

impl FileGroup {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            slots: (0..MAX_SLOTS).map(|_| None).collect(),
            open_files: BoundedCounter::new("group.open_files", MAX_OPEN_FILES),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Seat {
    group: GroupId,
    slot: SlotId,
    notify: Option<NotifyId>,
}

struct EngineState {
    groups: Vec<Option<FileGroup>>,
    seats: HashMap<FileId, Seat>,
    /// Sum of live reservoirs' target depths, checked against the budget.
    depth_total: usize,
    /// Filesystem-structural writes; placed one block each, never batched.
    meta: VecDeque<Descriptor>,
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Per-device write-back engine.
///
/// Owns the group table and every reservoir on one device. Placement and
/// dispatch are delegated to the [`BlockAllocator`] and [`Transport`]
/// collaborators handed in at construction.
pub struct ReservoirEngine {
    device: DeviceId,
    config: ReservoirConfig,
    allocator: Arc<dyn BlockAllocator>,
    transport: Arc<dyn Transport>,
    rt: Arc<RtController>,
    scratch: Arc<ScratchPool>,
    tracker: Arc<CompletionTracker>,
    state: Mutex<EngineState>,
    stats: Mutex<ReservoirStats>,
}

impl ReservoirEngine {
    #[must_use]
    pub fn new(
        device: DeviceId,
        config: ReservoirConfig,
        allocator: Arc<dyn BlockAllocator>,
        transport: Arc<dyn Transport>,
        rt: Arc<RtController>,
        scratch: Arc<ScratchPool>,
    ) -> Self {
        Self {
            device,
            config,
            allocator,
            transport,
            rt,
            scratch,
            tracker: Arc::new(CompletionTracker::new()),
            state: Mutex::new(EngineState {
                groups: (0..MAX_GROUPS).map(|_| None).collect(),
                seats: HashMap::new(),
                depth_total: 0,
                meta: VecDeque::new(),
            }),
            stats: Mutex::new(ReservoirStats::default()),
        }
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Tracker shared with every dispatched descriptor; sync paths wait on it.
    #[must_use]
    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    /// Transport this engine dispatches through.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn stats(&self) -> ReservoirStats {
        self.stats.lock().clone()
    }

    // ── File membership ─────────────────────────────────────────────────────

    /// Seat `file` in the reservoir at (`group`, `slot`), creating the group
    /// and the reservoir lazily. A file already seated elsewhere is detached
    /// first; ownership transfer replaces prior membership.
    pub fn add_file(&self, file: FileId, group: GroupId, slot: SlotId) -> Result<()> {
        if !group.in_range() {
            return Err(RevoError::InvalidGroup { group: group.0 });
        }
        if !slot.in_range() {
            return Err(RevoError::InvalidSlot {
                group: group.0,
                slot: slot.0,
            });
        }

        let mut state = self.state.lock();
        if let Some(seat) = state.seats.get(&file).copied() {
            if seat.group == group && seat.slot == slot {
                return Ok(());
            }
            // Unseat first: the detach below releases the file's hold, so a
            // failed release drain must not leave a stale seat entry behind.
            state.seats.remove(&file);
            self.detach_locked(&mut state, seat)?;
        }

        let gi = usize::from(group.0);
        let group_entry = state.groups[gi].get_or_insert_with(|| {
            tracing::debug!(
                target: "revo::reservoir",
                device = self.device.0,
                group = group.0,
                "file group created"
            );
            FileGroup::new(group)
        });
        let si = usize::from(slot.0);
        let created = group_entry.slots[si].is_none();
        let seated = group_entry.slots[si]
            .get_or_insert_with(|| Reservoir::new(self.config.target_depth))
            .files
            .increment();
        if !seated {
            return Err(RevoError::Busy);
        }
        if !group_entry.open_files.increment() {
            if let Some(reservoir) = group_entry.slots[si].as_mut() {
                reservoir.files.decrement();
            }
            return Err(RevoError::Busy);
        }
        if created {
            state.depth_total += self.config.target_depth;
        }
        state.seats.insert(
            file,
            Seat {
                group,
                slot,
                notify: None,
            },
        );
        tracing::debug!(
            target: "revo::reservoir",
            device = self.device.0,
            file = file.0,
            group = group.0,
            slot = slot.0,
            "file seated"
        );
        Ok(())
    }

    /// Detach `file` and block until every outstanding descriptor on this
    /// device has completed. If the file was the last holder of its
    /// reservoir, the remaining queue is release-drained first.
    pub fn remove_file(&self, file: FileId) -> Result<()> {
        let detach = {
            let mut state = self.state.lock();
            let Some(seat) = state.seats.remove(&file) else {
                return Err(RevoError::UnknownFile { file: file.0 });
            };
            if let Some(notify) = seat.notify {
                tracing::debug!(
                    target: "revo::reservoir",
                    device = self.device.0,
                    file = file.0,
                    notify = notify.0,
                    "notified stream closed"
                );
            }
            self.detach_locked(&mut state, seat)
        };
        self.tracker.wait_idle()?;
        detach
    }

    /// Associate a completion-notification id with an open file.
    pub fn set_notify(&self, file: FileId, notify: NotifyId) -> Result<()> {
        let mut state = self.state.lock();
        match state.seats.get_mut(&file) {
            Some(seat) => {
                seat.notify = Some(notify);
                Ok(())
            }
            None => Err(RevoError::UnknownFile { file: file.0 }),
        }
    }

    /// Move `file` to a different (`group`, `slot`) seat. Descriptors queued
    /// in the old reservoir are not dropped: they stay queued if other files
    /// still hold the reservoir, or go out in a release drain if the file
    /// was the last holder.
    pub fn retarget(&self, file: FileId, group: GroupId, slot: SlotId) -> Result<()> {
        {
            let state = self.state.lock();
            if !state.seats.contains_key(&file) {
                return Err(RevoError::UnknownFile { file: file.0 });
            }
        }
        self.add_file(file, group, slot)?;
        self.stats.lock().retargets += 1;
        Ok(())
    }

    // ── Write path ──────────────────────────────────────────────────────────

    /// Queue one descriptor on the file's reservoir. Reaching the target
    /// depth triggers a capacity drain on the caller's thread; drain errors
    /// therefore land on the writer that tipped the queue over.
    pub fn submit(&self, file: FileId, descriptor: Descriptor) -> Result<()> {
        let mut state = self.state.lock();
        let seat = match state.seats.get(&file) {
            Some(seat) => *seat,
            None => return Err(RevoError::UnknownFile { file: file.0 }),
        };
        self.stats.lock().submitted += 1;

        let gi = usize::from(seat.group.0);
        let si = usize::from(seat.slot.0);
        let Some(reservoir) = state.groups[gi]
            .as_mut()
            .and_then(|group| group.slots[si].as_mut())
        else {
            return Err(RevoError::UnknownFile { file: file.0 });
        };
        reservoir.queue.push_back(descriptor);
        tracing::trace!(
            target: "revo::reservoir",
            device = self.device.0,
            file = file.0,
            queued = reservoir.queue.len(),
            depth = reservoir.target_depth,
            "descriptor queued"
        );
        if reservoir.queue.len() >= reservoir.target_depth {
            self.drain_reservoir(seat.group, seat.slot, reservoir, DrainReason::Capacity)?;
        }
        Ok(())
    }

    /// Queue a filesystem-structural write. Metadata descriptors are placed
    /// one block each at flush time and survive metadata-only flushes.
    pub fn submit_metadata(&self, descriptor: Descriptor) {
        let mut flags = descriptor.flags();
        flags.metadata = true;
        let descriptor = descriptor.with_flags(flags);
        self.state.lock().meta.push_back(descriptor);
    }

    /// Multiply the file's reservoir depth by `factor` (relative to the
    /// unstretched base). Real-time streams only; the device-wide descriptor
    /// budget caps the result.
    pub fn stretch(&self, file: FileId, factor: u32) -> Result<()> {
        if factor == 0 || factor > MAX_STRETCH_FACTOR {
            return Err(RevoError::InvalidStretch { factor });
        }
        // RT state before the engine lock, per the lock order.
        if !self.rt.is_rt(self.device) {
            self.stats.lock().stretch_rejects += 1;
            return Err(RevoError::NotRealTime);
        }

        let mut state = self.state.lock();
        let seat = match state.seats.get(&file) {
            Some(seat) => *seat,
            None => return Err(RevoError::UnknownFile { file: file.0 }),
        };
        let depth_total = state.depth_total;
        let budget = self.config.descriptor_budget;
        let gi = usize::from(seat.group.0);
        let si = usize::from(seat.slot.0);
        let Some(reservoir) = state.groups[gi]
            .as_mut()
            .and_then(|group| group.slots[si].as_mut())
        else {
            return Err(RevoError::UnknownFile { file: file.0 });
        };

        let new_depth = reservoir
            .base_depth
            .saturating_mul(usize::try_from(factor).unwrap_or(usize::MAX));
        let proposed = depth_total - reservoir.target_depth + new_depth;
        if proposed > budget {
            self.stats.lock().stretch_rejects += 1;
            return Err(RevoError::BudgetExceeded {
                requested: proposed,
                budget,
            });
        }
        reservoir.target_depth = new_depth;
        let overfull = reservoir.queue.len() >= new_depth;
        state.depth_total = proposed;
        tracing::debug!(
            target: "revo::reservoir",
            device = self.device.0,
            file = file.0,
            factor,
            depth = new_depth,
            "reservoir stretched"
        );
        // Shrinking below the current queue length fires a drain now.
        if overfull {
            if let Some(reservoir) = state.groups[gi]
                .as_mut()
                .and_then(|group| group.slots[si].as_mut())
            {
                self.drain_reservoir(seat.group, seat.slot, reservoir, DrainReason::Capacity)?;
            }
        }
        Ok(())
    }

    // ── Flush surface ───────────────────────────────────────────────────────

    /// Anything queued anywhere on the device?
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        !state.meta.is_empty()
            || state
                .groups
                .iter()
                .flatten()
                .any(|group| group.slots.iter().flatten().any(|r| !r.queue.is_empty()))
    }

    /// Descriptors queued across all reservoirs (excludes metadata).
    #[must_use]
    pub fn queued_total(&self) -> usize {
        let state = self.state.lock();
        state
            .groups
            .iter()
            .flatten()
            .flat_map(|group| group.slots.iter().flatten())
            .map(|r| r.queue.len())
            .sum()
    }

    /// Drain every dirty reservoir (and the metadata queue) to media.
    /// Returns the number of descriptors dispatched. With `metadata_only`
    /// set, file data stays queued and only structural writes go out.
    pub fn drain_all(&self, metadata_only: bool) -> Result<usize> {
        let mut state = self.state.lock();
        let mut total = 0_usize;

        while let Some(mut descriptor) = state.meta.pop_front() {
            let block = match self.allocator.reserve_one() {
                Ok(block) => block,
                Err(err) => {
                    state.meta.push_front(descriptor);
                    return Err(err);
                }
            };
            descriptor.place(block);
            descriptor.chain_completion(self.tracker.completion());
            self.transport.dispatch(descriptor)?;
            self.stats.lock().metadata_dispatched += 1;
            total += 1;
        }
        if metadata_only {
            return Ok(total);
        }

        let state = &mut *state;
        for entry in &mut state.groups {
            let Some(group) = entry.as_mut() else { continue };
            let gid = group.id;
            for (si, slot) in group.slots.iter_mut().enumerate() {
                let sid = SlotId(u16::try_from(si).unwrap_or(u16::MAX));
                if let Some(reservoir) = slot.as_mut() {
                    if !reservoir.queue.is_empty() {
                        total +=
                            self.drain_reservoir(gid, sid, reservoir, DrainReason::Flush)?;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Block until every dispatched descriptor has completed.
    pub fn wait_quiescent(&self) -> Result<()> {
        self.tracker.wait_idle()
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Remove one seat's hold on its reservoir. Caller holds the engine
    /// lock and has already removed the seat entry.
    fn detach_locked(&self, state: &mut EngineState, seat: Seat) -> Result<()> {
        let gi = usize::from(seat.group.0);
        let si = usize::from(seat.slot.0);
        let mut removed_depth = 0_usize;
        let mut release = Ok(());
        let mut drop_group = false;

        if let Some(group) = state.groups[gi].as_mut() {
            let emptied = group.slots[si].as_mut().is_some_and(|reservoir| {
                reservoir.files.decrement();
                reservoir.files.is_zero()
            });
            if emptied {
                if let Some(mut reservoir) = group.slots[si].take() {
                    removed_depth = reservoir.target_depth;
                    release = self
                        .drain_reservoir(seat.group, seat.slot, &mut reservoir, DrainReason::Release)
                        .map(|_| ());
                    // If placement failed outright, the leftover descriptors
                    // have nowhere to go; complete them with an error so
                    // their callbacks still fire.
                    for descriptor in reservoir.queue.drain(..) {
                        descriptor.finish(Completion::HardwareError(libc::ENOSPC));
                    }
                }
            }
            group.open_files.decrement();
            drop_group = group.open_files.is_zero();
        }
        if drop_group {
            state.groups[gi] = None;
            tracing::debug!(
                target: "revo::reservoir",
                device = self.device.0,
                group = seat.group.0,
                "file group released"
            );
        }
        state.depth_total = state.depth_total.saturating_sub(removed_depth);
        release
    }

    fn drain_reservoir(
        &self,
        group: GroupId,
        slot: SlotId,
        reservoir: &mut Reservoir,
        reason: DrainReason,
    ) -> Result<usize> {
        let queued = reservoir.queue.len();
        if queued == 0 {
            return Ok(0);
        }
        self.stats.lock().drains += 1;

        let unit = u32::try_from(reservoir.target_depth.max(queued)).unwrap_or(u32::MAX);
        let run = self.claim_unit(unit);
        tracing::debug!(
            target: "revo::reservoir",
            device = self.device.0,
            group = group.0,
            slot = slot.0,
            queued,
            unit,
            contiguous = run.is_some(),
            reason = ?reason,
            "drain"
        );

        match run {
            Some(run) => self.dispatch_contiguous(reservoir, run),
            None => self.dispatch_per_block(reservoir),
        }
    }

    /// Claim one whole placement unit, yielding between attempts so a
    /// concurrent free can land. `None` means fall back to per-block claims.
    fn claim_unit(&self, unit: u32) -> Option<ContiguousRun> {
        for attempt in 0..=self.config.claim_retries {
            match self.allocator.reserve_contiguous(unit) {
                Ok(run) => return Some(run),
                Err(_) if attempt < self.config.claim_retries => std::thread::yield_now(),
                Err(_) => break,
            }
        }
        None
    }

    fn dispatch_contiguous(&self, reservoir: &mut Reservoir, run: ContiguousRun) -> Result<usize> {
        self.stats.lock().contiguous_drains += 1;
        let mut blocks = run.blocks();
        let mut dispatched = 0_u64;
        let mut first_err: Option<RevoError> = None;

        while let Some(descriptor) = reservoir.queue.pop_front() {
            let Some(block) = blocks.next() else {
                // Unreachable: the unit is at least as long as the queue.
                reservoir.queue.push_front(descriptor);
                break;
            };
            let mut flags = descriptor.flags();
            flags.sequential = true;
            let mut descriptor = descriptor.with_flags(flags);
            descriptor.place(block);
            descriptor.chain_completion(self.tracker.completion());
            match self.transport.dispatch(descriptor) {
                Ok(()) => dispatched += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "revo::reservoir",
                        device = self.device.0,
                        block = block.0,
                        %err,
                        "dispatch failed"
                    );
                    first_err.get_or_insert(err);
                }
            }
        }

        // Pad the unconsumed tail so the whole run stays owned by this batch.
        for block in blocks {
            let addr = match self.scratch.alloc(self.config.block_bytes) {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::warn!(
                        target: "revo::reservoir",
                        device = self.device.0,
                        %err,
                        "tail padding skipped"
                    );
                    first_err.get_or_insert(err);
                    break;
                }
            };
            let mut pad = Descriptor::padding(addr, self.config.block_bytes);
            pad.place(block);
            let pool = Arc::clone(&self.scratch);
            let len = self.config.block_bytes;
            pad.chain_completion(Box::new(move |_| pool.release(addr, len)));
            pad.chain_completion(self.tracker.completion());
            match self.transport.dispatch(pad) {
                Ok(()) => self.stats.lock().padding_dispatched += 1,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        self.stats.lock().dispatched += dispatched;
        match first_err {
            Some(err) => Err(err),
            None => Ok(usize::try_from(dispatched).unwrap_or(usize::MAX)),
        }
    }

    fn dispatch_per_block(&self, reservoir: &mut Reservoir) -> Result<usize> {
        self.stats.lock().fallback_drains += 1;
        let mut dispatched = 0_u64;
        let mut first_err: Option<RevoError> = None;

        while let Some(descriptor) = reservoir.queue.pop_front() {
            let block = match self.allocator.reserve_one() {
                Ok(block) => block,
                Err(err) => {
                    // Nowhere to place the rest; keep it queued and dirty.
                    reservoir.queue.push_front(descriptor);
                    self.stats.lock().dispatched += dispatched;
                    return Err(err);
                }
            };
            let mut descriptor = descriptor;
            descriptor.place(block);
            descriptor.chain_completion(self.tracker.completion());
            match self.transport.dispatch(descriptor) {
                Ok(()) => dispatched += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "revo::reservoir",
                        device = self.device.0,
                        block = block.0,
                        %err,
                        "dispatch failed"
                    );
                    first_err.get_or_insert(err);
                }
            }
        }

        self.stats.lock().dispatched += dispatched;
        match first_err {
            Some(err) => Err(err),
            None => Ok(usize::try_from(dispatched).unwrap_or(usize::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revo_alloc::BitmapAllocator;
    use revo_transport::{DeferredTransport, MemTransport, Segment};
    use revo_types::BlockNumber;

    const BLOCK: u32 = 512;

    fn config(depth: usize) -> ReservoirConfig {
        ReservoirConfig {
            target_depth: depth,
            descriptor_budget: 64,
            block_bytes: BLOCK,
            claim_retries: 1,
        }
    }

    fn engine_with(
        depth: usize,
        allocator: Arc<dyn BlockAllocator>,
        transport: Arc<dyn Transport>,
    ) -> ReservoirEngine {
        ReservoirEngine::new(
            DeviceId(0),
            config(depth),
            allocator,
            transport,
            Arc::new(RtController::new()),
            Arc::new(ScratchPool::new(0x8000, 64 * 1024)),
        )
    }

    fn data(addr: u64) -> Descriptor {
        Descriptor::new(vec![Segment { addr, len: BLOCK }])
    }

    #[test]
    fn seating_validates_group_and_slot_bounds() {
        let engine = engine_with(
            4,
            Arc::new(BitmapAllocator::new(64)),
            Arc::new(MemTransport::new(1 << 20)),
        );
        assert!(matches!(
            engine.add_file(FileId(1), GroupId(9), SlotId(0)),
            Err(RevoError::InvalidGroup { group: 9 })
        ));
        assert!(matches!(
            engine.add_file(FileId(1), GroupId(0), SlotId(99)),
            Err(RevoError::InvalidSlot { slot: 99, .. })
        ));
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
    }

    #[test]
    fn submit_to_unseated_file_is_rejected() {
        let engine = engine_with(
            4,
            Arc::new(BitmapAllocator::new(64)),
            Arc::new(MemTransport::new(1 << 20)),
        );
        assert!(matches!(
            engine.submit(FileId(42), data(0)),
            Err(RevoError::UnknownFile { file: 42 })
        ));
    }

    #[test]
    fn capacity_drain_is_contiguous_and_fifo() {
        let transport = Arc::new(DeferredTransport::new());
        let engine = engine_with(4, Arc::new(BitmapAllocator::new(64)), transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");

        for i in 0..3_u64 {
            engine.submit(FileId(1), data(i * 1024)).expect("submit");
        }
        assert_eq!(transport.pending(), 0, "below depth must not drain");
        assert_eq!(engine.queued_total(), 3);

        engine.submit(FileId(1), data(3 * 1024)).expect("submit");
        let targets = transport.pending_targets();
        assert_eq!(targets.len(), 4);
        for pair in targets.windows(2) {
            assert_eq!(pair[1].0, pair[0].0 + 1, "placement must be contiguous");
        }
        assert_eq!(engine.queued_total(), 0, "drain empties the queue");
        assert_eq!(engine.stats().contiguous_drains, 1);
        assert_eq!(engine.stats().padding_dispatched, 0);
    }

    #[test]
    fn close_pads_the_partial_unit() {
        let allocator = Arc::new(BitmapAllocator::new(64));
        let transport = Arc::new(MemTransport::new(1 << 20));
        let engine = engine_with(4, allocator.clone(), transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");

        engine.submit(FileId(1), data(0)).expect("submit");
        engine.submit(FileId(1), data(1024)).expect("submit");
        engine.remove_file(FileId(1)).expect("close");

        // Two data blocks plus two scratch pads consume the full unit.
        assert_eq!(allocator.free_blocks(), 60);
        assert_eq!(engine.stats().padding_dispatched, 2);
        assert_eq!(transport.stats().dispatched, 4);
        assert!(!engine.is_dirty());
    }

    #[test]
    fn fragmented_media_falls_back_to_per_block_claims() {
        let allocator = Arc::new(BitmapAllocator::new(32));
        for i in (0..32).step_by(2) {
            allocator.mark_used(BlockNumber(i), 1);
        }
        let transport = Arc::new(DeferredTransport::new());
        let engine = engine_with(2, allocator, transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");

        engine.submit(FileId(1), data(0)).expect("submit");
        engine.submit(FileId(1), data(1024)).expect("submit");

        let targets = transport.pending_targets();
        assert_eq!(targets.len(), 2, "fallback still dispatches everything");
        assert_ne!(targets[1].0, targets[0].0 + 1);
        assert_eq!(engine.stats().fallback_drains, 1);
        assert_eq!(engine.stats().padding_dispatched, 0, "fallback never pads");
    }

    #[test]
    fn stretch_needs_rt_and_respects_the_budget() {
        let rt = Arc::new(RtController::new());
        let engine = ReservoirEngine::new(
            DeviceId(0),
            config(4),
            Arc::new(BitmapAllocator::new(256)),
            Arc::new(DeferredTransport::new()),
            rt.clone(),
            Arc::new(ScratchPool::new(0x8000, 64 * 1024)),
        );
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");

        assert!(matches!(
            engine.stretch(FileId(1), 2),
            Err(RevoError::NotRealTime)
        ));
        assert_eq!(engine.stats().stretch_rejects, 1);

        rt.request_rt(DeviceId(0));
        assert!(matches!(
            engine.stretch(FileId(1), 0),
            Err(RevoError::InvalidStretch { factor: 0 })
        ));
        assert!(matches!(
            engine.stretch(FileId(1), MAX_STRETCH_FACTOR + 1),
            Err(RevoError::InvalidStretch { .. })
        ));

        engine.stretch(FileId(1), 2).expect("stretch");
        // Depth is now 8: seven submits stay queued.
        for i in 0..7_u64 {
            engine.submit(FileId(1), data(i * 1024)).expect("submit");
        }
        assert_eq!(engine.queued_total(), 7);

        // A second reservoir occupies 4 of the 64-descriptor budget, so
        // stretching the first to 64 (4 * 16) no longer fits.
        engine
            .add_file(FileId(2), GroupId(0), SlotId(1))
            .expect("seat");
        assert!(matches!(
            engine.stretch(FileId(1), 16),
            Err(RevoError::BudgetExceeded {
                requested: 68,
                budget: 64
            })
        ));
        assert_eq!(engine.stats().stretch_rejects, 2);
    }

    #[test]
    fn stretch_back_down_drains_an_overfull_queue() {
        let rt = Arc::new(RtController::new());
        let transport = Arc::new(DeferredTransport::new());
        let engine = ReservoirEngine::new(
            DeviceId(0),
            config(2),
            Arc::new(BitmapAllocator::new(64)),
            transport.clone(),
            rt.clone(),
            Arc::new(ScratchPool::new(0x8000, 64 * 1024)),
        );
        rt.request_rt(DeviceId(0));
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
        engine.stretch(FileId(1), 2).expect("stretch up");
        for i in 0..3_u64 {
            engine.submit(FileId(1), data(i * 1024)).expect("submit");
        }
        assert_eq!(transport.pending(), 0);

        engine.stretch(FileId(1), 1).expect("stretch down");
        assert_eq!(transport.pending(), 3, "shrink drains the queue now");
    }

    #[test]
    fn retarget_preserves_queued_descriptors() {
        let transport = Arc::new(MemTransport::new(1 << 20));
        let engine = engine_with(4, Arc::new(BitmapAllocator::new(64)), transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
        engine.submit(FileId(1), data(0)).expect("submit");
        engine.submit(FileId(1), data(1024)).expect("submit");

        engine
            .retarget(FileId(1), GroupId(1), SlotId(2))
            .expect("retarget");

        // The old reservoir had no other holder: its queue release-drained.
        let stats = engine.stats();
        assert_eq!(stats.retargets, 1);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(engine.queued_total(), 0);

        // The new seat accepts writes.
        engine.submit(FileId(1), data(2048)).expect("submit");
        assert_eq!(engine.queued_total(), 1);
    }

    #[test]
    fn retarget_out_of_a_shared_reservoir_keeps_the_queue() {
        let transport = Arc::new(DeferredTransport::new());
        let engine = engine_with(4, Arc::new(BitmapAllocator::new(64)), transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
        engine
            .add_file(FileId(2), GroupId(0), SlotId(0))
            .expect("seat");
        engine.submit(FileId(1), data(0)).expect("submit");
        engine.submit(FileId(1), data(1024)).expect("submit");

        engine
            .retarget(FileId(1), GroupId(1), SlotId(0))
            .expect("retarget");

        // File 2 still holds the source reservoir: its queue is untouched.
        assert_eq!(engine.queued_total(), 2);
        assert_eq!(transport.pending(), 0);
        assert_eq!(engine.stats().dispatched, 0);

        // Totals add up across source and destination on the next flush.
        engine.submit(FileId(1), data(2048)).expect("submit");
        assert_eq!(engine.queued_total(), 3);
        let dispatched = engine.drain_all(false).expect("flush");
        assert_eq!(dispatched, 3, "each descriptor reaches media exactly once");
    }

    #[test]
    fn failed_release_drain_unseats_the_file() {
        let allocator = Arc::new(BitmapAllocator::new(0));
        let engine = engine_with(4, allocator, Arc::new(MemTransport::new(1 << 20)));
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");

        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);
        let descriptor =
            data(0).on_complete(Box::new(move |outcome| *seen_cb.lock() = Some(outcome)));
        engine.submit(FileId(1), descriptor).expect("submit");

        // No block anywhere on the device: the release drain behind the
        // retarget fails outright.
        assert!(matches!(
            engine.retarget(FileId(1), GroupId(1), SlotId(0)),
            Err(RevoError::NoSpace)
        ));
        // The stranded descriptor still completed with an error...
        assert_eq!(*seen.lock(), Some(Completion::HardwareError(libc::ENOSPC)));
        // ...and the file lost its seat outright; reseating starts clean.
        assert!(matches!(
            engine.submit(FileId(1), data(0)),
            Err(RevoError::UnknownFile { file: 1 })
        ));
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("reseat");
    }

    #[test]
    fn padding_scratch_is_reclaimed_across_drains() {
        let allocator = Arc::new(BitmapAllocator::new(64));
        let transport = Arc::new(MemTransport::new(1 << 20));
        let scratch = Arc::new(ScratchPool::new(0x8000, u64::from(BLOCK) * 2));
        let engine = ReservoirEngine::new(
            DeviceId(0),
            config(4),
            allocator.clone(),
            transport.clone(),
            Arc::new(RtController::new()),
            scratch.clone(),
        );

        // Each close pads 2 of the 4 claimed blocks. The pool only holds one
        // close's worth, so repeat closes rely on completions handing the
        // bytes back.
        for _ in 0..2 {
            engine
                .add_file(FileId(1), GroupId(0), SlotId(0))
                .expect("seat");
            engine.submit(FileId(1), data(0)).expect("submit");
            engine.submit(FileId(1), data(1024)).expect("submit");
            engine.remove_file(FileId(1)).expect("close");
        }

        assert_eq!(engine.stats().padding_dispatched, 4);
        assert_eq!(transport.stats().dispatched, 8);
        assert_eq!(allocator.free_blocks(), 64 - 8);
        assert_eq!(scratch.used(), 0);
    }

    #[test]
    fn shared_reservoir_survives_one_closer() {
        let transport = Arc::new(MemTransport::new(1 << 20));
        let engine = engine_with(8, Arc::new(BitmapAllocator::new(64)), transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
        engine
            .add_file(FileId(2), GroupId(0), SlotId(0))
            .expect("seat");
        engine.submit(FileId(1), data(0)).expect("submit");

        engine.remove_file(FileId(1)).expect("close");
        // File 2 still holds the reservoir: nothing drained.
        assert_eq!(engine.queued_total(), 1);
        assert!(engine.is_dirty());

        engine.remove_file(FileId(2)).expect("close");
        assert!(!engine.is_dirty());
    }

    #[test]
    fn metadata_only_flush_leaves_file_data_queued() {
        let transport = Arc::new(MemTransport::new(1 << 20));
        let engine = engine_with(4, Arc::new(BitmapAllocator::new(64)), transport.clone());
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
        engine.submit(FileId(1), data(0)).expect("submit");
        engine.submit_metadata(data(1024));

        let dispatched = engine.drain_all(true).expect("metadata flush");
        assert_eq!(dispatched, 1);
        assert_eq!(engine.stats().metadata_dispatched, 1);
        assert!(engine.is_dirty(), "file data still queued");

        let dispatched = engine.drain_all(false).expect("full flush");
        assert_eq!(dispatched, 1);
        assert!(!engine.is_dirty());
    }

    #[test]
    fn allocator_exhaustion_surfaces_to_the_writer() {
        let allocator = Arc::new(BitmapAllocator::new(2));
        let engine = engine_with(4, allocator, Arc::new(MemTransport::new(1 << 20)));
        engine
            .add_file(FileId(1), GroupId(0), SlotId(0))
            .expect("seat");
        for i in 0..3_u64 {
            engine.submit(FileId(1), data(i * 1024)).expect("submit");
        }
        // The fourth submit trips a drain: no 4-run, and only 2 singles.
        assert!(matches!(
            engine.submit(FileId(1), data(4096)),
            Err(RevoError::NoSpace)
        ));
        // What could be placed went out; the rest stays queued.
        assert_eq!(engine.stats().dispatched, 2);
        assert_eq!(engine.queued_total(), 2);
        assert!(engine.is_dirty());
    }
}
