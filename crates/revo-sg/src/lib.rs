#![forbid(unsafe_code)]
//! Direct-transfer scatter-gather descriptor builder.
//!
//! Streams opened in direct mode hand the pipeline raw (address, length)
//! runs instead of staged buffers. This crate batches those runs into
//! logical pages of exactly [`SgConfig::page_bytes`] each, because the
//! transport only moves whole pages:
//!
//! - entries accumulate in fixed-capacity chunks; filling a chunk chains an
//!   overflow chunk, and the chain exposes one uniform append API
//! - an append that crosses a page-byte boundary is split so a page never
//!   exceeds its size
//! - commit pads a partially-filled page with one dummy scratch entry up to
//!   the page size
//!
//! The read-path variant additionally aligns the caller's range to the
//! transport's minimum transfer unit with leading/trailing scratch padding,
//! coalesces physically-contiguous caller segments, and blocks until every
//! constructed descriptor has completed.
//!
//! Chunks of a chain are visited strictly in append order on both paths.

use parking_lot::Mutex;
use revo_error::{Result, RevoError};
use revo_transport::{
    CompletionTracker, Descriptor, DescriptorFlags, Direction, Segment, Transport,
};
use revo_types::{BlockNumber, MIN_TRANSFER_UNIT, SG_PAGE_ENTRIES, TRANSFER_PAGE_BYTES};
use std::sync::Arc;

/// Builder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgConfig {
    /// Bytes per committed logical page.
    pub page_bytes: u32,
    /// Entries per chunk before chaining an overflow chunk.
    pub page_entries: usize,
    /// Minimum transfer unit for read-path alignment.
    pub min_unit: u32,
}

impl Default for SgConfig {
    fn default() -> Self {
        Self {
            page_bytes: TRANSFER_PAGE_BYTES,
            page_entries: SG_PAGE_ENTRIES,
            min_unit: MIN_TRANSFER_UNIT,
        }
    }
}

// ── Scratch pool ────────────────────────────────────────────────────────────

/// Fixed scratch region managed as a first-fit free list.
///
/// Padding and alignment entries point here and hand their bytes back
/// through [`release`](Self::release) when the descriptor referencing them
/// completes, so steady-state padding never wears the pool down. Exhaustion
/// is an error on the triggering write, not a panic: the caller is expected
/// to dispatch what it already built (bias toward preserving data over
/// perfect alignment).
#[derive(Debug)]
pub struct ScratchPool {
    base: u64,
    size: u64,
    state: Mutex<ScratchState>,
}

#[derive(Debug)]
struct ScratchState {
    /// Disjoint free spans as (offset, len), sorted by offset.
    free: Vec<(u64, u64)>,
    used: u64,
}

impl ScratchPool {
    #[must_use]
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            state: Mutex::new(ScratchState {
                free: vec![(0, size)],
                used: 0,
            }),
        }
    }

    /// Claim `len` scratch bytes, returning their bus address.
    pub fn alloc(&self, len: u32) -> Result<u64> {
        let need = u64::from(len);
        let mut state = self.state.lock();
        let Some(i) = state.free.iter().position(|&(_, span)| span >= need) else {
            tracing::warn!(
                target: "revo::sg",
                need = len,
                used = state.used,
                size = self.size,
                "scratch pool exhausted"
            );
            return Err(RevoError::ScratchExhausted { need: len });
        };
        let (offset, span) = state.free[i];
        if span == need {
            state.free.remove(i);
        } else {
            state.free[i] = (offset + need, span - need);
        }
        state.used += need;
        Ok(self.base + offset)
    }

    /// Return `len` bytes at `addr` to the pool. Legal once no dispatched
    /// descriptor references them; padding completion callbacks call this.
    pub fn release(&self, addr: u64, len: u32) {
        let span = u64::from(len);
        if span == 0 {
            return;
        }
        if addr < self.base || addr - self.base + span > self.size {
            tracing::warn!(target: "revo::sg", addr, len, "release outside the pool");
            return;
        }
        let offset = addr - self.base;
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(span);
        let at = state.free.partition_point(|&(o, _)| o < offset);
        state.free.insert(at, (offset, span));
        // Merge with both neighbours so long pads stay claimable.
        if at + 1 < state.free.len()
            && state.free[at].0 + state.free[at].1 == state.free[at + 1].0
        {
            state.free[at].1 += state.free[at + 1].1;
            state.free.remove(at + 1);
        }
        if at > 0 && state.free[at - 1].0 + state.free[at - 1].1 == state.free[at].0 {
            state.free[at - 1].1 += state.free[at].1;
            state.free.remove(at);
        }
    }

    /// Bytes currently claimed.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.state.lock().used
    }
}

// ── Page chain ──────────────────────────────────────────────────────────────

/// Fixed-capacity entry chunk; overflow chains the next chunk in the chain.
#[derive(Debug)]
struct SgChunk {
    entries: Vec<Segment>,
}

/// Commit-time pad entry; returns its scratch bytes when the page's
/// descriptor completes.
#[derive(Debug)]
struct PadEntry {
    segment: Segment,
    pool: Arc<ScratchPool>,
}

/// One logical page: a chain of entry chunks summing to exactly
/// `page_bytes` once committed.
#[derive(Debug)]
pub struct PageChain {
    chunks: Vec<SgChunk>,
    total: u32,
    /// Present only on pages sealed short by a commit.
    pad: Option<PadEntry>,
}

impl PageChain {
    /// Entries flattened in append order across chunk boundaries.
    pub fn entries(&self) -> impl Iterator<Item = Segment> + '_ {
        self.chunks.iter().flat_map(|c| c.entries.iter().copied())
    }

    /// Number of chained chunks (1 unless entry capacity overflowed).
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u32 {
        self.total
    }

    /// Bytes contributed by the commit-time pad entry (0 for full pages).
    #[must_use]
    pub fn pad_bytes(&self) -> u32 {
        self.pad.as_ref().map_or(0, |pad| pad.segment.len)
    }

    /// Convert into a direct-mode write descriptor (placement unresolved).
    #[must_use]
    pub fn into_descriptor(self) -> Descriptor {
        let segments: Vec<Segment> = self.entries().collect();
        let mut descriptor = Descriptor::new(segments).with_flags(DescriptorFlags {
            direct: true,
            ..DescriptorFlags::default()
        });
        if let Some(pad) = self.pad {
            descriptor.chain_completion(Box::new(move |_| {
                pad.pool.release(pad.segment.addr, pad.segment.len);
            }));
        }
        descriptor
    }
}

// ── Write-path builder ──────────────────────────────────────────────────────

/// Accumulates direct-transfer entries into whole logical pages.
#[derive(Debug)]
pub struct DirectWriteBuilder {
    config: SgConfig,
    scratch: Arc<ScratchPool>,
    chunks: Vec<SgChunk>,
    total: u32,
    ready: Vec<PageChain>,
}

impl DirectWriteBuilder {
    /// # Panics
    ///
    /// Panics on a degenerate configuration (zero page size or entry count).
    #[must_use]
    pub fn new(config: SgConfig, scratch: Arc<ScratchPool>) -> Self {
        assert!(config.page_bytes > 0 && config.page_entries > 0);
        Self {
            config,
            scratch,
            chunks: Vec::new(),
            total: 0,
            ready: Vec::new(),
        }
    }

    /// Append one (address, length) run.
    ///
    /// Runs crossing a page-byte boundary are split; entry-capacity overflow
    /// within a page chains an overflow chunk transparently.
    pub fn append(&mut self, addr: u64, len: u32) {
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            let room = self.config.page_bytes - self.total;
            let take = remaining.min(room);
            self.push_entry(Segment { addr, len: take });
            addr += u64::from(take);
            remaining -= take;
            if self.total == self.config.page_bytes {
                self.seal_page(None);
            }
        }
    }

    fn push_entry(&mut self, segment: Segment) {
        let need_chunk = self
            .chunks
            .last()
            .is_none_or(|c| c.entries.len() >= self.config.page_entries);
        if need_chunk {
            if !self.chunks.is_empty() {
                tracing::trace!(
                    target: "revo::sg",
                    chunks = self.chunks.len() + 1,
                    total = self.total,
                    "chaining overflow chunk"
                );
            }
            self.chunks.push(SgChunk {
                entries: Vec::with_capacity(self.config.page_entries),
            });
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.entries.push(segment);
        }
        self.total += segment.len;
        // An entry pushing a page past its byte size is an upstream logic
        // bug (the boundary split above makes it unreachable): abort rather
        // than emit a malformed page.
        assert!(
            self.total <= self.config.page_bytes,
            "page total exceeded page size without sealing"
        );
    }

    fn seal_page(&mut self, pad: Option<PadEntry>) {
        let chunks = std::mem::take(&mut self.chunks);
        let total = self.total;
        self.total = 0;
        tracing::debug!(
            target: "revo::sg",
            total,
            pad_bytes = pad.as_ref().map_or(0, |p| p.segment.len),
            chunks = chunks.len(),
            "page sealed"
        );
        self.ready.push(PageChain { chunks, total, pad });
    }

    /// Bytes accumulated in the current (unsealed) page.
    #[must_use]
    pub fn pending_bytes(&self) -> u32 {
        self.total
    }

    /// Take pages that filled to capacity since the last call.
    pub fn take_ready(&mut self) -> Vec<PageChain> {
        std::mem::take(&mut self.ready)
    }

    /// Seal the current partial page (file close, page boundary, explicit
    /// sync), padding it with one dummy scratch entry to exactly one page.
    ///
    /// Returns every sealed page, including previously-filled ones. A
    /// scratch failure fails the commit but leaves already-full pages
    /// retrievable via [`take_ready`](Self::take_ready).
    pub fn commit(&mut self) -> Result<Vec<PageChain>> {
        if self.total > 0 {
            let pad = self.config.page_bytes - self.total;
            let mut entry = None;
            if pad > 0 {
                let segment = Segment {
                    addr: self.scratch.alloc(pad)?,
                    len: pad,
                };
                self.push_entry(segment);
                entry = Some(PadEntry {
                    segment,
                    pool: Arc::clone(&self.scratch),
                });
            }
            self.seal_page(entry);
        }
        Ok(std::mem::take(&mut self.ready))
    }
}

// ── Read-path builder ───────────────────────────────────────────────────────

/// Builds and executes an aligned direct-transfer read.
///
/// The caller supplies destination buffer runs and the byte range it wants
/// from the stored page. The builder pads the range out to the minimum
/// transfer unit with scratch entries, coalesces contiguous destination
/// runs, dispatches, and blocks until every completion has been observed.
#[derive(Debug)]
pub struct DirectReadBuilder {
    config: SgConfig,
    scratch: Arc<ScratchPool>,
    buffers: Vec<Segment>,
}

impl DirectReadBuilder {
    #[must_use]
    pub fn new(config: SgConfig, scratch: Arc<ScratchPool>) -> Self {
        Self {
            config,
            scratch,
            buffers: Vec::new(),
        }
    }

    /// Add a destination buffer run, coalescing with the previous run when
    /// physically contiguous.
    pub fn add_buffer(&mut self, addr: u64, len: u32) {
        if let Some(last) = self.buffers.last_mut() {
            if last.addr + u64::from(last.len) == addr {
                last.len += len;
                return;
            }
        }
        self.buffers.push(Segment { addr, len });
    }

    /// Coalesced destination runs built so far.
    #[must_use]
    pub fn buffers(&self) -> &[Segment] {
        &self.buffers
    }

    /// Execute the read of `len` bytes starting `offset` bytes into `block`,
    /// blocking until the transfer completes.
    ///
    /// The destination runs must sum to exactly `len`.
    pub fn execute(
        self,
        transport: &dyn Transport,
        tracker: &Arc<CompletionTracker>,
        block: BlockNumber,
        offset: u32,
        len: u32,
    ) -> Result<()> {
        let supplied: u64 = self.buffers.iter().map(|s| u64::from(s.len)).sum();
        if supplied != u64::from(len) {
            return Err(RevoError::Misaligned {
                offset: u64::from(offset),
                len: u64::from(len),
            });
        }

        // The transfer spans the unit-aligned range around the request: it
        // starts `lead` bytes before `offset` within the block and the tail
        // pad rounds the end up to the next unit boundary.
        let lead = offset % self.config.min_unit;
        let start = offset - lead;
        let tail_end = (offset + len) % self.config.min_unit;
        let tail = if tail_end == 0 {
            0
        } else {
            self.config.min_unit - tail_end
        };

        let mut segments = Vec::with_capacity(self.buffers.len() + 2);
        let mut pads: Vec<Segment> = Vec::new();
        if lead > 0 {
            let pad = Segment {
                addr: self.scratch.alloc(lead)?,
                len: lead,
            };
            pads.push(pad);
            segments.push(pad);
        }
        segments.extend_from_slice(&self.buffers);
        if tail > 0 {
            let addr = match self.scratch.alloc(tail) {
                Ok(addr) => addr,
                Err(err) => {
                    for pad in &pads {
                        self.scratch.release(pad.addr, pad.len);
                    }
                    return Err(err);
                }
            };
            let pad = Segment { addr, len: tail };
            pads.push(pad);
            segments.push(pad);
        }

        tracing::debug!(
            target: "revo::sg",
            block = block.0,
            offset,
            len,
            start,
            lead,
            tail,
            runs = segments.len(),
            "direct read dispatch"
        );

        let mut descriptor = Descriptor::new(segments)
            .with_direction(Direction::FromStorage)
            .with_flags(DescriptorFlags {
                direct: true,
                ..DescriptorFlags::default()
            })
            .on_complete(tracker.completion());
        if !pads.is_empty() {
            let pool = Arc::clone(&self.scratch);
            descriptor.chain_completion(Box::new(move |_| {
                for pad in pads {
                    pool.release(pad.addr, pad.len);
                }
            }));
        }
        descriptor.place_at(block, start);
        transport.dispatch(descriptor)?;

        // Data may not be handed back to the caller until every completion
        // flag has been observed.
        tracker.wait_idle()
    }
}
