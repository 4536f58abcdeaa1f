#![forbid(unsafe_code)]
//! Block placement collaborator interface.
//!
//! The reservoir engine treats placement as an external service with two
//! operations: claim one contiguous run, or claim one block. This crate
//! defines that contract ([`BlockAllocator`]) plus an in-memory bitmap
//! implementation used by tests and the simulation CLI.
//!
//! ## Design
//!
//! 1. **Bitmap** — raw bit manipulation over a free map.
//! 2. **BitmapAllocator** — run and single-block claims under a short mutex.

use parking_lot::Mutex;
use revo_error::{Result, RevoError};
use revo_types::BlockNumber;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice (set = in use).
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = usize::try_from(idx / 8).unwrap_or(usize::MAX);
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return true;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let byte_idx = usize::try_from(idx / 8).unwrap_or(usize::MAX);
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let byte_idx = usize::try_from(idx / 8).unwrap_or(usize::MAX);
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first free (zero) bit in the first `count` bits, from `start`,
/// wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find `n` contiguous free bits in the first `count` bits.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u64, n: u64) -> Option<u64> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0_u64;
    let mut run_len = 0_u64;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

// ── Claim result ────────────────────────────────────────────────────────────

/// A claimed run of consecutively addressed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousRun {
    /// First claimed block.
    pub start: BlockNumber,
    /// Number of contiguous blocks claimed.
    pub count: u32,
}

impl ContiguousRun {
    /// Iterate the blocks of the run in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        (0..u64::from(self.count)).map(|i| BlockNumber(self.start.0 + i))
    }
}

// ── Collaborator contract ───────────────────────────────────────────────────

/// Block placement service.
///
/// Implementations must be safe to call from writer context and from the
/// flush daemon; calls may block briefly but must not wait on descriptor
/// completion (the reservoir holds its queue lock across a claim).
pub trait BlockAllocator: Send + Sync {
    /// Claim `n` consecutively addressed blocks, or fail without claiming any.
    ///
    /// Failure here is placement pressure, not exhaustion: callers fall back
    /// to [`reserve_one`](Self::reserve_one) per descriptor.
    fn reserve_contiguous(&self, n: u32) -> Result<ContiguousRun>;

    /// Claim a single block anywhere on the device.
    fn reserve_one(&self) -> Result<BlockNumber>;

    /// Free blocks remaining.
    fn free_blocks(&self) -> u64;
}

// ── In-memory bitmap allocator ──────────────────────────────────────────────

#[derive(Debug)]
struct BitmapState {
    bitmap: Vec<u8>,
    free: u64,
    /// Rotating search start for single-block claims.
    cursor: u64,
}

/// Bitmap-backed allocator over a fixed block count.
///
/// Used by tests and the simulation CLI; production deployments supply their
/// own [`BlockAllocator`] over the real media layout.
#[derive(Debug)]
pub struct BitmapAllocator {
    total: u64,
    state: Mutex<BitmapState>,
}

impl BitmapAllocator {
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        let bytes = usize::try_from(total_blocks.div_ceil(8)).unwrap_or(usize::MAX);
        Self {
            total: total_blocks,
            state: Mutex::new(BitmapState {
                bitmap: vec![0_u8; bytes],
                free: total_blocks,
                cursor: 0,
            }),
        }
    }

    /// Pre-mark a range as in use (e.g. a simulated filesystem header).
    pub fn mark_used(&self, start: BlockNumber, count: u32) {
        let mut state = self.state.lock();
        for i in 0..u64::from(count) {
            let idx = start.0 + i;
            if idx < self.total && !bitmap_get(&state.bitmap, idx) {
                bitmap_set(&mut state.bitmap, idx);
                state.free -= 1;
            }
        }
    }
}

impl BlockAllocator for BitmapAllocator {
    fn reserve_contiguous(&self, n: u32) -> Result<ContiguousRun> {
        let mut state = self.state.lock();
        if u64::from(n) > state.free {
            return Err(RevoError::NoSpace);
        }
        let Some(start) = bitmap_find_contiguous(&state.bitmap, self.total, u64::from(n)) else {
            tracing::debug!(
                target: "revo::alloc",
                n,
                free = state.free,
                "no contiguous run available"
            );
            return Err(RevoError::NoSpace);
        };
        for i in 0..u64::from(n) {
            bitmap_set(&mut state.bitmap, start + i);
        }
        state.free -= u64::from(n);
        tracing::trace!(target: "revo::alloc", start, n, "contiguous run claimed");
        Ok(ContiguousRun {
            start: BlockNumber(start),
            count: n,
        })
    }

    fn reserve_one(&self) -> Result<BlockNumber> {
        let mut state = self.state.lock();
        if state.free == 0 {
            return Err(RevoError::NoSpace);
        }
        let cursor = state.cursor;
        let Some(idx) = bitmap_find_free(&state.bitmap, self.total, cursor) else {
            return Err(RevoError::NoSpace);
        };
        bitmap_set(&mut state.bitmap, idx);
        state.free -= 1;
        state.cursor = (idx + 1) % self.total.max(1);
        Ok(BlockNumber(idx))
    }

    fn free_blocks(&self) -> u64 {
        self.state.lock().free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_contiguous_skips_used_runs() {
        let mut bitmap = vec![0_u8; 4];
        bitmap_set(&mut bitmap, 2);
        // Blocks 0..=1 are a free run of 2; a run of 3 must start past block 2.
        assert_eq!(bitmap_find_contiguous(&bitmap, 32, 2), Some(0));
        assert_eq!(bitmap_find_contiguous(&bitmap, 32, 3), Some(3));
    }

    #[test]
    fn contiguous_claim_is_consecutive() {
        let alloc = BitmapAllocator::new(64);
        let run = alloc.reserve_contiguous(8).expect("claim");
        let blocks: Vec<_> = run.blocks().collect();
        assert_eq!(blocks.len(), 8);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].0, pair[0].0 + 1);
        }
        assert_eq!(alloc.free_blocks(), 56);
    }

    #[test]
    fn contiguous_claim_fails_when_fragmented() {
        let alloc = BitmapAllocator::new(16);
        // Occupy every even block: longest free run is 1.
        for i in (0..16).step_by(2) {
            alloc.mark_used(BlockNumber(i), 1);
        }
        assert!(matches!(
            alloc.reserve_contiguous(2),
            Err(RevoError::NoSpace)
        ));
        // Single-block claims still succeed.
        assert!(alloc.reserve_one().is_ok());
    }

    #[test]
    fn reserve_one_exhausts_cleanly() {
        let alloc = BitmapAllocator::new(4);
        for _ in 0..4 {
            alloc.reserve_one().expect("claim");
        }
        assert!(matches!(alloc.reserve_one(), Err(RevoError::NoSpace)));
        assert_eq!(alloc.free_blocks(), 0);
    }

    #[test]
    fn reserve_one_never_repeats_a_block() {
        let alloc = BitmapAllocator::new(32);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let block = alloc.reserve_one().expect("claim");
            assert!(seen.insert(block), "block {block:?} claimed twice");
        }
    }
}
