// =============================================================================
// CacheEntry — ordered, deduplicated bar sequence for one series
// =============================================================================
//
// Invariant: after any mutation the sequence is strictly ordered by
// `open_time` with no duplicates. Incoming bars never need to be pre-sorted;
// an incoming bar whose `open_time` already exists replaces the stored bar
// (last-write-wins). Bars are only discarded through `enforce_tail_limit`,
// never silently during a merge.
// =============================================================================

use std::time::Instant;

use crate::types::{Bar, Priority};

/// Per-series cache state held by the memory tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    bars: Vec<Bar>,
    pub priority: Priority,
    pub last_write: Instant,
    pub retention_limit: usize,
}

impl CacheEntry {
    pub fn new(priority: Priority, retention_limit: usize) -> Self {
        Self {
            bars: Vec::new(),
            priority,
            last_write: Instant::now(),
            retention_limit,
        }
    }

    /// Build an entry from an already-loaded snapshot (disk/fast-cache
    /// promotion). The snapshot is merged bar by bar so the ordering and
    /// dedup invariant holds even for a corrupted source.
    pub fn from_bars(bars: Vec<Bar>, priority: Priority, retention_limit: usize) -> Self {
        let mut entry = Self::new(priority, retention_limit);
        entry.merge(bars);
        entry
    }

    /// Merge `incoming` into the sequence. Returns the number of bars that
    /// replaced an existing `open_time` (the rest were inserted).
    pub fn merge(&mut self, incoming: Vec<Bar>) -> usize {
        let mut replaced = 0;
        for bar in incoming {
            match self.bars.binary_search_by_key(&bar.open_time, |b| b.open_time) {
                Ok(idx) => {
                    self.bars[idx] = bar;
                    replaced += 1;
                }
                Err(idx) => self.bars.insert(idx, bar),
            }
        }
        self.last_write = Instant::now();
        replaced
    }

    /// Trim to at most `limit` most-recent bars. The only discard path.
    pub fn enforce_tail_limit(&mut self, limit: usize) {
        if self.bars.len() > limit {
            let excess = self.bars.len() - limit;
            self.bars.drain(..excess);
        }
    }

    /// The most recent `limit` bars, oldest-first.
    pub fn tail(&self, limit: usize) -> Vec<Bar> {
        let start = self.bars.len().saturating_sub(limit);
        self.bars[start..].to_vec()
    }

    /// The most recent bar, if any.
    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Full snapshot, oldest-first. Used by the flusher and the materializer.
    pub fn snapshot(&self) -> Vec<Bar> {
        self.bars.clone()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
