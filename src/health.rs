// =============================================================================
// HistoryHealthAnalyzer — tail-health classification for one series
// =============================================================================
//
// Stateless and pure: every call reads the store and produces a fresh
// `HistoryStatus`; nothing is mutated and nothing is persisted. Invoked after
// ingest batches and on the periodic health timer.
//
// Classification is first-match-wins, top to bottom:
//   1. insufficient      — total rows below the minimum required depth
//   2. stale_tail        — tail older than the staleness threshold (masks a
//                          simultaneous gap condition; diagnostics are still
//                          computed and needs_backfill stays true)
//   3. non_monotonic_tail — a strictly negative open_time step (delta == 0 is
//                          dedup noise, not a structural defect)
//   4. gappy_tail        — a step above gap_factor × tf_ms
//   5. ok
// =============================================================================

use std::sync::Arc;

use crate::store::TieredStore;
use crate::types::{interval_ms, Bar, HistoryState, HistoryStatus, SeriesKey};

/// Tunables for tail classification, lifted straight from `RuntimeConfig`.
#[derive(Debug, Clone)]
pub struct HealthParams {
    pub min_history_rows: usize,
    pub tail_window: usize,
    pub gap_factor: f64,
    pub stale_after_bars: f64,
}

/// Read-only analyzer over the tiered store.
pub struct HistoryHealthAnalyzer {
    store: Arc<TieredStore>,
    params: HealthParams,
}

impl HistoryHealthAnalyzer {
    pub fn new(store: Arc<TieredStore>, params: HealthParams) -> Self {
        Self { store, params }
    }

    /// Classify the series' recent tail as of `now_ms` (ms since epoch).
    pub fn compute_history_status(&self, key: &SeriesKey, now_ms: i64) -> HistoryStatus {
        let tf_ms = interval_ms(&key.interval).unwrap_or(60_000);
        let total_rows = self.store.rows_in_ram(key).max(self.store.disk().row_count(key));
        let tail = self.store.get_df(key, self.params.tail_window);
        classify_tail(total_rows, &tail, tf_ms, now_ms, &self.params)
    }
}

/// Pure classification over an already-fetched tail. `total_rows` is the
/// series' total known depth (which may exceed the tail window).
pub fn classify_tail(
    total_rows: usize,
    tail: &[Bar],
    tf_ms: i64,
    now_ms: i64,
    params: &HealthParams,
) -> HistoryStatus {
    // Diagnostics are always computed, even when a higher-priority state
    // masks the classification they would drive.
    let mut gaps_count = 0u32;
    let mut max_gap_ms = 0i64;
    let mut non_monotonic_count = 0u32;
    let gap_threshold = (params.gap_factor * tf_ms as f64) as i64;

    for pair in tail.windows(2) {
        let delta = pair[1].open_time - pair[0].open_time;
        if delta < 0 {
            non_monotonic_count += 1;
        } else if delta > gap_threshold {
            gaps_count += 1;
            max_gap_ms = max_gap_ms.max(delta);
        }
    }

    let last_open_time = tail.last().map(|b| b.open_time);
    let age_seconds = last_open_time.map(|t| (now_ms - t) / 1_000);

    let stale_threshold_ms = (params.stale_after_bars * tf_ms as f64) as i64;
    let is_stale = last_open_time
        .map(|t| now_ms - t > stale_threshold_ms)
        .unwrap_or(false);

    let state = if total_rows < params.min_history_rows {
        HistoryState::Insufficient
    } else if is_stale {
        HistoryState::StaleTail
    } else if non_monotonic_count > 0 {
        HistoryState::NonMonotonicTail
    } else if gaps_count > 0 {
        HistoryState::GappyTail
    } else {
        HistoryState::Ok
    };

    HistoryStatus {
        state,
        gaps_count,
        max_gap_ms,
        non_monotonic_count,
        last_open_time,
        age_seconds,
        needs_backfill: state != HistoryState::Ok,
    }
}

// =============================================================================
// Tests
// =============================================================================
