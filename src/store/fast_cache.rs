// =============================================================================
// FastCache — middle tier between process memory and durable disk
// =============================================================================
//
// The fast tier is a shared external resource in production (a remote cache
// reached over the network). No client crate is pinned here; the store talks
// to the tier through the `FastCache` trait so a remote implementation can be
// slotted in without touching `TieredStore`. The bundled `InProcessFastCache`
// implements the same contract in process memory and exposes an availability
// switch so outage handling can be exercised in tests.
//
// Failure semantics: every method can fail with `CacheError::TransientIo`;
// the store degrades to memory-only and logs, it never surfaces the failure
// to the ingestion caller.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::types::{Bar, CacheError, SeriesKey};

/// Contract of the fast middle tier.
pub trait FastCache: Send + Sync {
    /// Write the most recent bar for a series (hot-path write).
    fn put_latest(&self, key: &SeriesKey, bar: &Bar) -> Result<(), CacheError>;

    /// Replace the full retained snapshot for a series (promotion path).
    fn put_snapshot(&self, key: &SeriesKey, bars: &[Bar]) -> Result<(), CacheError>;

    /// Read the stored snapshot for a series, if present.
    fn get_snapshot(&self, key: &SeriesKey) -> Result<Option<Vec<Bar>>, CacheError>;

    /// Drop a series from the tier (eviction).
    fn evict(&self, key: &SeriesKey) -> Result<(), CacheError>;
}

/// In-process implementation of the fast tier.
pub struct InProcessFastCache {
    entries: RwLock<HashMap<SeriesKey, Vec<Bar>>>,
    available: AtomicBool,
}

impl InProcessFastCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (tests) or reflect a lost remote connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::TransientIo("fast cache unavailable".to_string()))
        }
    }
}

impl Default for InProcessFastCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FastCache for InProcessFastCache {
    fn put_latest(&self, key: &SeriesKey, bar: &Bar) -> Result<(), CacheError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let bars = entries.entry(key.clone()).or_default();
        match bars.binary_search_by_key(&bar.open_time, |b| b.open_time) {
            Ok(idx) => bars[idx] = bar.clone(),
            Err(idx) => bars.insert(idx, bar.clone()),
        }
        Ok(())
    }

    fn put_snapshot(&self, key: &SeriesKey, snapshot: &[Bar]) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries.write().insert(key.clone(), snapshot.to_vec());
        Ok(())
    }

    fn get_snapshot(&self, key: &SeriesKey) -> Result<Option<Vec<Bar>>, CacheError> {
        self.check_available()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn evict(&self, key: &SeriesKey) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries.write().remove(key);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn put_latest_keeps_order_and_replaces() {
        let cache = InProcessFastCache::new();
        let key = SeriesKey::new("BTCUSDT", "1m");

        cache.put_latest(&key, &bar(60_000, 2.0)).unwrap();
        cache.put_latest(&key, &bar(0, 1.0)).unwrap();
        cache.put_latest(&key, &bar(60_000, 5.0)).unwrap();

        let bars = cache.get_snapshot(&key).unwrap().unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 0);
        assert!((bars[1].close - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unavailable_cache_reports_transient_io() {
        let cache = InProcessFastCache::new();
        let key = SeriesKey::new("BTCUSDT", "1m");
        cache.set_available(false);

        let err = cache.put_latest(&key, &bar(0, 1.0)).unwrap_err();
        assert!(matches!(err, CacheError::TransientIo(_)));

        cache.set_available(true);
        assert!(cache.put_latest(&key, &bar(0, 1.0)).is_ok());
    }

    #[test]
    fn evict_removes_series() {
        let cache = InProcessFastCache::new();
        let key = SeriesKey::new("ETHUSDT", "5m");
        cache.put_snapshot(&key, &[bar(0, 1.0)]).unwrap();
        cache.evict(&key).unwrap();
        assert!(cache.get_snapshot(&key).unwrap().is_none());
    }
}
