// =============================================================================
// TimeframeMaterializer — derive higher-timeframe views from the base chain
// =============================================================================
//
// When a read asks for an interval no tier holds (or holds stale), the
// materializer rebuilds it from the canonical base interval: base bars are
// grouped into calendar-aligned buckets (`open_time - open_time % tf_ms`,
// never sliding windows) and a bucket contributes an output bar only if it is
// complete — full slot count, correct first/last alignment, no internal step
// above the gap threshold. Incomplete trailing buckets are dropped, never
// emitted partially.
//
// The materialized result is written back through `TieredStore::put_bars`, so
// repeated reads hit the memory tier directly and the derived series
// participates in TTL/eviction like any first-class entry.
// =============================================================================

use std::sync::Arc;

use tracing::debug;

use crate::store::TieredStore;
use crate::types::{interval_ms, Bar, SeriesKey};

pub struct TimeframeMaterializer {
    store: Arc<TieredStore>,
    base_interval: String,
    gap_factor: f64,
}

impl TimeframeMaterializer {
    pub fn new(store: Arc<TieredStore>, base_interval: impl Into<String>, gap_factor: f64) -> Self {
        Self {
            store,
            base_interval: base_interval.into(),
            gap_factor,
        }
    }

    /// Return up to `limit` most-recent bars of `target_interval` for
    /// `symbol`, deriving them from the base chain when no tier has a fresh
    /// direct snapshot. Returns an empty vec when the base chain cannot build
    /// even one complete bucket — never a partial or synthesized bar.
    pub fn get_or_materialize(&self, symbol: &str, target_interval: &str, limit: usize) -> Vec<Bar> {
        let target_key = SeriesKey::new(symbol, target_interval);

        if target_interval == self.base_interval {
            return self.store.get_df(&target_key, limit);
        }

        let (Some(base_tf), Some(target_tf)) = (
            interval_ms(&self.base_interval),
            interval_ms(target_interval),
        ) else {
            return self.store.get_df(&target_key, limit);
        };
        if target_tf <= base_tf || target_tf % base_tf != 0 {
            // Not derivable from the base chain; direct snapshot or nothing.
            return self.store.get_df(&target_key, limit);
        }

        let base_key = SeriesKey::new(symbol, &self.base_interval);
        let base_last = self.store.get_last(&base_key).map(|b| b.open_time);

        let direct = self.store.get_df(&target_key, limit);
        if !direct.is_empty() {
            match (direct.last().map(|b| b.open_time), base_last) {
                (Some(direct_last), Some(base_last)) => {
                    if direct_last >= newest_complete_bucket(base_last, base_tf, target_tf) {
                        return direct;
                    }
                    // Stale relative to the base chain — re-derive below.
                }
                // No base chain to derive from; direct is the best we have.
                _ => return direct,
            }
        }

        // Fetch enough base bars to cover `limit` target buckets plus one
        // partial bucket at each end.
        let ratio = (target_tf / base_tf) as usize;
        let wanted = limit.saturating_add(2).saturating_mul(ratio);
        let base_bars = self.store.get_df(&base_key, wanted);

        let derived = aggregate_aligned(&base_bars, base_tf, target_tf, self.gap_factor);
        if derived.is_empty() {
            debug!(
                symbol,
                target = target_interval,
                base_rows = base_bars.len(),
                "materialization produced no complete buckets"
            );
            return direct;
        }

        debug!(
            symbol,
            target = target_interval,
            buckets = derived.len(),
            "materialized from base chain — memoizing"
        );
        // Memoize: the derived view becomes a first-class entry.
        self.store.put_bars(&target_key, derived);
        self.store.get_df(&target_key, limit)
    }
}

/// Start of the newest target bucket that `base_last` (the open of the most
/// recent base bar) fully covers.
fn newest_complete_bucket(base_last: i64, base_tf: i64, target_tf: i64) -> i64 {
    let bucket = base_last - base_last.rem_euclid(target_tf);
    if base_last == bucket + target_tf - base_tf {
        bucket
    } else {
        bucket - target_tf
    }
}

/// Group `base` bars (strictly ordered by `open_time`) into calendar-aligned
/// `target_tf` buckets, emitting only complete buckets.
pub fn aggregate_aligned(base: &[Bar], base_tf: i64, target_tf: i64, gap_factor: f64) -> Vec<Bar> {
    let slots = (target_tf / base_tf) as usize;
    let gap_threshold = (gap_factor * base_tf as f64) as i64;
    let mut out = Vec::new();

    let mut i = 0;
    while i < base.len() {
        let bucket = base[i].open_time - base[i].open_time.rem_euclid(target_tf);
        let end = bucket + target_tf;

        // Collect this bucket's bars.
        let mut j = i;
        while j < base.len() && base[j].open_time < end {
            j += 1;
        }
        let group = &base[i..j];

        if is_complete(group, bucket, base_tf, target_tf, slots, gap_threshold) {
            out.push(fold_bucket(group, bucket, target_tf));
        }
        i = j;
    }
    out
}

fn is_complete(
    group: &[Bar],
    bucket: i64,
    base_tf: i64,
    target_tf: i64,
    slots: usize,
    gap_threshold: i64,
) -> bool {
    if group.len() != slots {
        return false;
    }
    if group[0].open_time != bucket {
        return false;
    }
    if group[group.len() - 1].open_time != bucket + target_tf - base_tf {
        return false;
    }
    group
        .windows(2)
        .all(|pair| pair[1].open_time - pair[0].open_time <= gap_threshold)
}

fn fold_bucket(group: &[Bar], bucket: i64, target_tf: i64) -> Bar {
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for bar in group {
        high = high.max(bar.high);
        low = low.min(bar.low);
        volume += bar.volume;
    }
    Bar {
        open_time: bucket,
        close_time: bucket + target_tf - 1,
        open: group[0].open,
        high,
        low,
        close: group[group.len() - 1].close,
        volume,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreProfile;
    use crate::store::{DiskTier, InProcessFastCache};

    const M1: i64 = 60_000;
    const M5: i64 = 300_000;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar {
            open_time,
            close_time: open_time + M1 - 1,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    /// Minute bars covering `count` minutes from `start`.
    fn minutes(start: i64, count: usize) -> Vec<Bar> {
        (0..count as i64)
            .map(|i| bar(start + i * M1, 100.0 + i as f64))
            .collect()
    }

    #[test]
    fn aggregates_complete_buckets_only() {
        // 10 minutes: two complete 5m buckets.
        let bars = minutes(0, 10);
        let out = aggregate_aligned(&bars, M1, M5, 1.5);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].open_time, 0);
        assert_eq!(out[1].open_time, M5);
        assert_eq!(out[0].close_time, M5 - 1);
    }

    #[test]
    fn bucket_with_internal_gap_is_excluded() {
        // Minutes 0..10 but minute 2 missing: first bucket incomplete.
        let mut bars = minutes(0, 10);
        bars.remove(2);
        let out = aggregate_aligned(&bars, M1, M5, 1.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time, M5);
    }

    #[test]
    fn trailing_incomplete_bucket_is_dropped() {
        // 7 minutes: one complete bucket, the trailing 2 minutes dropped.
        let bars = minutes(0, 7);
        let out = aggregate_aligned(&bars, M1, M5, 1.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time, 0);
    }

    #[test]
    fn misaligned_leading_bars_do_not_form_a_bucket() {
        // Starts mid-bucket at minute 2: bucket 0 lacks minutes 0-1.
        let bars = minutes(2 * M1, 8);
        let out = aggregate_aligned(&bars, M1, M5, 1.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time, M5);
    }

    #[test]
    fn ohlcv_folding_is_correct() {
        let bars = minutes(0, 5);
        let out = aggregate_aligned(&bars, M1, M5, 1.5);
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert!((b.open - 99.5).abs() < f64::EPSILON); // first bar's open
        assert!((b.close - 104.0).abs() < f64::EPSILON); // last bar's close
        assert!((b.high - 105.0).abs() < f64::EPSILON); // max high
        assert!((b.low - 99.0).abs() < f64::EPSILON); // min low
        assert!((b.volume - 50.0).abs() < f64::EPSILON); // summed
    }

    #[test]
    fn insufficient_base_history_yields_empty() {
        let bars = minutes(0, 3);
        assert!(aggregate_aligned(&bars, M1, M5, 1.5).is_empty());
        assert!(aggregate_aligned(&[], M1, M5, 1.5).is_empty());
    }

    fn materializer_fixture(
        dir: &std::path::Path,
    ) -> (Arc<TieredStore>, TimeframeMaterializer) {
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir));
        let (store, _rx, _backlog) =
            TieredStore::new(fast, disk, StoreProfile::default(), 10_000, 256);
        let store = Arc::new(store);
        let mat = TimeframeMaterializer::new(store.clone(), "1m", 1.5);
        (store, mat)
    }

    #[test]
    fn materializes_and_memoizes_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mat) = materializer_fixture(dir.path());
        let base = SeriesKey::new("BTCUSDT", "1m");
        store.put_bars(&base, minutes(0, 25));

        let out = mat.get_or_materialize("BTCUSDT", "5m", 100);
        assert_eq!(out.len(), 5);

        // Memoized: the derived series is now a first-class entry.
        assert_eq!(store.rows_in_ram(&SeriesKey::new("BTCUSDT", "5m")), 5);
    }

    #[test]
    fn fresh_direct_snapshot_is_returned_without_rederiving() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mat) = materializer_fixture(dir.path());
        let base = SeriesKey::new("BTCUSDT", "1m");
        store.put_bars(&base, minutes(0, 25));

        let first = mat.get_or_materialize("BTCUSDT", "5m", 100);
        let second = mat.get_or_materialize("BTCUSDT", "5m", 100);
        assert_eq!(first, second);
    }

    #[test]
    fn stale_direct_snapshot_is_rederived_when_base_advances() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mat) = materializer_fixture(dir.path());
        let base = SeriesKey::new("BTCUSDT", "1m");
        store.put_bars(&base, minutes(0, 10));

        let out = mat.get_or_materialize("BTCUSDT", "5m", 100);
        assert_eq!(out.len(), 2);

        // Base advances by two more full buckets.
        store.put_bars(&base, minutes(10 * M1, 10));
        let out = mat.get_or_materialize("BTCUSDT", "5m", 100);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn no_base_chain_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, mat) = materializer_fixture(dir.path());
        assert!(mat.get_or_materialize("BTCUSDT", "5m", 100).is_empty());
    }
}
