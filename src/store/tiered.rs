// =============================================================================
// TieredStore — memory / fast-cache / disk with write-behind persistence
// =============================================================================
//
// Hot path: `put_bars` merges into the memory tier and writes the latest bar
// through the fast tier synchronously, then enqueues the series for a durable
// write. It never touches disk and never surfaces tier failures to the
// ingestion caller — a failed fast-cache write or a full flush queue degrades
// to memory-only with a warning.
//
// Read path: memory hit, else fast-cache hit (promote to memory), else disk
// hit (promote to memory and fast cache), else empty. Interval strings no
// tier knows about are the materializer's problem (see materialize.rs).
//
// Concurrency: per-series `Arc<RwLock<CacheEntry>>` under an outer map lock,
// so many readers can scan one series while a single writer merges into it.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StoreProfile;
use crate::store::disk::DiskTier;
use crate::store::entry::CacheEntry;
use crate::store::fast_cache::FastCache;
use crate::store::flusher::FlushRequest;
use crate::types::{Bar, Priority, SeriesKey};

/// The three-tier bar store. Constructed once at boot and passed by `Arc` to
/// every component; owns all `CacheEntry` lifetimes.
pub struct TieredStore {
    entries: RwLock<HashMap<SeriesKey, Arc<RwLock<CacheEntry>>>>,
    fast: Arc<dyn FastCache>,
    disk: Arc<DiskTier>,
    profile: StoreProfile,
    retention_limit: usize,

    flush_tx: mpsc::Sender<FlushRequest>,
    flush_backlog: Arc<AtomicUsize>,
    degraded_durability: AtomicBool,
}

impl TieredStore {
    /// Build the store plus the receiving half of its flush queue (handed to
    /// the write-behind flusher).
    pub fn new(
        fast: Arc<dyn FastCache>,
        disk: Arc<DiskTier>,
        profile: StoreProfile,
        retention_limit: usize,
        flush_queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<FlushRequest>, Arc<AtomicUsize>) {
        let (flush_tx, flush_rx) = mpsc::channel(flush_queue_capacity);
        let flush_backlog = Arc::new(AtomicUsize::new(0));
        let store = Self {
            entries: RwLock::new(HashMap::new()),
            fast,
            disk,
            profile,
            retention_limit,
            flush_tx,
            flush_backlog: flush_backlog.clone(),
            degraded_durability: AtomicBool::new(false),
        };
        (store, flush_rx, flush_backlog)
    }

    // -------------------------------------------------------------------------
    // Hot write path
    // -------------------------------------------------------------------------

    /// Merge `bars` into the series, returning how many existing bars were
    /// replaced by dedup. Memory and fast cache are updated synchronously;
    /// the durable write is enqueued for the background flusher. Never blocks
    /// on disk I/O and never fails toward the caller.
    pub fn put_bars(&self, key: &SeriesKey, bars: Vec<Bar>) -> usize {
        if bars.is_empty() {
            return 0;
        }

        let entry = self.entry_handle(key);
        let (replaced, latest) = {
            let mut guard = entry.write();
            let replaced = guard.merge(bars);
            (replaced, guard.last().cloned())
        };

        // Fast tier gets at minimum the latest bar; unavailability degrades
        // to memory-only.
        if let Some(bar) = latest {
            if let Err(e) = self.fast.put_latest(key, &bar) {
                warn!(key = %key, error = %e, "fast-cache write failed — memory-only for this put");
            }
        }

        self.enqueue_flush(key);
        replaced
    }

    /// Queue a durable write for `key`. A full queue is logged and dropped;
    /// the next put for the series re-enqueues it.
    pub fn enqueue_flush(&self, key: &SeriesKey) {
        self.enqueue_flush_request(FlushRequest {
            key: key.clone(),
            snapshot: None,
        });
    }

    /// Re-queue a failed durable write. The request is kept whole so an
    /// eviction-captured snapshot survives the retry — the memory entry it
    /// was taken from is already gone.
    pub(crate) fn requeue_flush(&self, req: FlushRequest) {
        self.enqueue_flush_request(req);
    }

    fn enqueue_flush_request(&self, req: FlushRequest) {
        let key = req.key.clone();
        match self.flush_tx.try_send(req) {
            Ok(()) => {
                self.flush_backlog.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %key, "flush queue full — durable write deferred");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(key = %key, "flush queue closed — durable write dropped");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    /// The most recent `limit` bars for the series, oldest-first. Promotes
    /// fast-cache and disk hits into the hotter tiers. Returns an empty vec
    /// when no tier holds the series.
    pub fn get_df(&self, key: &SeriesKey, limit: usize) -> Vec<Bar> {
        // Memory tier.
        if let Some(entry) = self.entries.read().get(key) {
            let guard = entry.read();
            if !guard.is_empty() {
                return guard.tail(limit);
            }
        }

        // Fast tier -> promote into memory.
        match self.fast.get_snapshot(key) {
            Ok(Some(bars)) if !bars.is_empty() => {
                debug!(key = %key, rows = bars.len(), "fast-cache hit — promoting to memory");
                return self.promote(key, bars, false).tail(limit);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "fast-cache read failed — falling through to disk");
            }
            _ => {}
        }

        // Disk tier -> promote into memory and fast cache.
        match self.disk.read_snapshot(key) {
            Ok(Some(bars)) if !bars.is_empty() => {
                debug!(key = %key, rows = bars.len(), "disk hit — promoting to memory and fast cache");
                return self.promote(key, bars, true).tail(limit);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "disk read failed");
            }
        }

        Vec::new()
    }

    /// The most recent bar for the series, or `None`.
    pub fn get_last(&self, key: &SeriesKey) -> Option<Bar> {
        self.get_df(key, 1).pop()
    }

    // -------------------------------------------------------------------------
    // Retention & eviction
    // -------------------------------------------------------------------------

    /// Trim the series to at most `limit` most-recent bars. The only path
    /// that discards bars from memory.
    pub fn enforce_tail_limit(&self, key: &SeriesKey, limit: usize) {
        if let Some(entry) = self.entries.read().get(key) {
            entry.write().enforce_tail_limit(limit);
        }
    }

    /// Periodic eviction pass over the volatile tiers. Entries idle beyond
    /// the TTL for their timeframe class are dropped from memory and the fast
    /// cache (never disk), lowest priority first. Each evicted entry gets a
    /// final durable write enqueued so eviction cannot widen the lost-tail
    /// window. Returns the evicted keys.
    pub fn sweep(&self) -> Vec<SeriesKey> {
        let mut expired: Vec<(SeriesKey, Priority, Duration)> = Vec::new();
        {
            let entries = self.entries.read();
            for (key, entry) in entries.iter() {
                let guard = entry.read();
                let ttl = Duration::from_secs(self.profile.ttl_secs_for(&key.interval));
                let idle = guard.last_write.elapsed();
                if idle > ttl {
                    expired.push((key.clone(), guard.priority, idle));
                }
            }
        }

        // Cold entries first, Alert-pinned last; oldest within a class first.
        expired.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

        let mut evicted = Vec::with_capacity(expired.len());
        for (key, priority, idle) in expired {
            // Capture the snapshot before removal so the flusher still has
            // the final tail after the memory entry is gone.
            if let Some(snapshot) = self.snapshot_for(&key) {
                self.enqueue_flush_request(FlushRequest {
                    key: key.clone(),
                    snapshot: Some(snapshot),
                });
            }
            self.entries.write().remove(&key);
            if let Err(e) = self.fast.evict(&key) {
                warn!(key = %key, error = %e, "fast-cache evict failed");
            }
            info!(key = %key, priority = %priority, idle_secs = idle.as_secs(), "entry evicted from volatile tiers");
            evicted.push(key);
        }
        evicted
    }

    // -------------------------------------------------------------------------
    // Introspection (flusher, orchestrator, status API)
    // -------------------------------------------------------------------------

    /// Full in-memory snapshot for the series, if resident.
    pub fn snapshot_for(&self, key: &SeriesKey) -> Option<Vec<Bar>> {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.read().snapshot())
    }

    /// Rows currently resident in the memory tier for the series.
    pub fn rows_in_ram(&self, key: &SeriesKey) -> usize {
        self.entries
            .read()
            .get(key)
            .map_or(0, |entry| entry.read().len())
    }

    /// Pin or demote a series' eviction priority.
    pub fn set_priority(&self, key: &SeriesKey, priority: Priority) {
        if let Some(entry) = self.entries.read().get(key) {
            entry.write().priority = priority;
        }
    }

    /// Current depth of the pending durable-write queue.
    pub fn flush_backlog(&self) -> usize {
        self.flush_backlog.load(Ordering::SeqCst)
    }

    /// Whether repeated durable-write failures have forced memory+fast-cache
    /// only operation. Set and cleared by the flusher.
    pub fn is_degraded_durability(&self) -> bool {
        self.degraded_durability.load(Ordering::SeqCst)
    }

    pub(crate) fn set_degraded_durability(&self, degraded: bool) {
        self.degraded_durability.store(degraded, Ordering::SeqCst);
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn entry_handle(&self, key: &SeriesKey) -> Arc<RwLock<CacheEntry>> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        let mut entries = self.entries.write();
        entries
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(CacheEntry::new(
                    Priority::default(),
                    self.retention_limit,
                )))
            })
            .clone()
    }

    /// Install a loaded snapshot into the memory tier (and optionally the
    /// fast tier) and return a clone of the resulting entry state.
    fn promote(&self, key: &SeriesKey, bars: Vec<Bar>, to_fast: bool) -> CacheEntry {
        if to_fast {
            if let Err(e) = self.fast.put_snapshot(key, &bars) {
                warn!(key = %key, error = %e, "fast-cache promotion failed");
            }
        }
        let entry = self.entry_handle(key);
        let mut guard = entry.write();
        guard.merge(bars);
        guard.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fast_cache::InProcessFastCache;

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

    // The receiver is returned so the flush channel stays open for the
    // duration of a test; dropping it would make every try_send observe a
    // closed channel.
    fn test_store(
        dir: &std::path::Path,
    ) -> (
        TieredStore,
        Arc<InProcessFastCache>,
        mpsc::Receiver<FlushRequest>,
    ) {
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir));
        let (store, rx, _backlog) = TieredStore::new(
            fast.clone(),
            disk,
            StoreProfile::default(),
            1_500,
            64,
        );
        (store, fast, rx)
    }

    #[test]
    fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _fast, _rx) = test_store(dir.path());
        let key = SeriesKey::new("BTCUSDT", "1m");

        store.put_bars(&key, vec![bar(60_000, 2.0), bar(0, 1.0)]);
        let bars = store.get_df(&key, 10);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 0);
        assert_eq!(store.get_last(&key).unwrap().open_time, 60_000);
    }

    #[test]
    fn put_is_idempotent_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _fast, _rx) = test_store(dir.path());
        let key = SeriesKey::new("BTCUSDT", "1m");

        let batch = vec![bar(0, 1.0), bar(60_000, 2.0)];
        store.put_bars(&key, batch.clone());
        store.put_bars(&key, batch);
        assert_eq!(store.rows_in_ram(&key), 2);
    }

    #[test]
    fn fast_cache_outage_degrades_to_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let (store, fast, _rx) = test_store(dir.path());
        let key = SeriesKey::new("BTCUSDT", "1m");

        fast.set_available(false);
        // Must not panic or error toward the caller.
        store.put_bars(&key, vec![bar(0, 1.0)]);
        assert_eq!(store.rows_in_ram(&key), 1);
        assert_eq!(store.get_df(&key, 10).len(), 1);
    }

    #[test]
    fn disk_hit_promotes_to_memory_and_fast() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir.path()));
        let key = SeriesKey::new("BTCUSDT", "5m");
        disk.write_snapshot(&key, &[bar(0, 1.0), bar(300_000, 2.0)])
            .unwrap();

        let (store, _rx, _backlog) = TieredStore::new(
            fast.clone(),
            disk,
            StoreProfile::default(),
            1_500,
            64,
        );

        let bars = store.get_df(&key, 10);
        assert_eq!(bars.len(), 2);
        assert_eq!(store.rows_in_ram(&key), 2);
        assert_eq!(fast.get_snapshot(&key).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn enforce_tail_limit_trims_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _fast, _rx) = test_store(dir.path());
        let key = SeriesKey::new("BTCUSDT", "1m");

        store.put_bars(&key, (0..5).map(|i| bar(i * 60_000, i as f64)).collect());
        store.enforce_tail_limit(&key, 3);
        let bars = store.get_df(&key, 10);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].open_time, 120_000);
    }

    #[test]
    fn sweep_evicts_expired_but_not_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir.path()));
        let key = SeriesKey::new("BTCUSDT", "1m");
        disk.write_snapshot(&key, &[bar(0, 1.0)]).unwrap();

        // Zero TTLs: everything is immediately expired.
        let profile = StoreProfile {
            hot_ttl_secs: 0,
            warm_ttl_secs: 0,
            ..StoreProfile::default()
        };
        let (store, _rx, _backlog) =
            TieredStore::new(fast.clone(), disk, profile, 1_500, 64);

        store.put_bars(&key, vec![bar(60_000, 2.0)]);
        std::thread::sleep(Duration::from_millis(5));
        let evicted = store.sweep();
        assert_eq!(evicted, vec![key.clone()]);
        assert_eq!(store.rows_in_ram(&key), 0);

        // Disk still answers, and the read promotes back into memory.
        assert!(!store.get_df(&key, 10).is_empty());
    }

    #[test]
    fn sweep_orders_cold_before_alert() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir.path()));
        let profile = StoreProfile {
            hot_ttl_secs: 0,
            warm_ttl_secs: 0,
            ..StoreProfile::default()
        };
        let (store, _rx, _backlog) = TieredStore::new(fast, disk, profile, 1_500, 64);

        let cold = SeriesKey::new("COLD", "1m");
        let alert = SeriesKey::new("ALRT", "1m");
        store.put_bars(&alert, vec![bar(0, 1.0)]);
        store.put_bars(&cold, vec![bar(0, 1.0)]);
        store.set_priority(&cold, Priority::Cold);
        store.set_priority(&alert, Priority::Alert);

        std::thread::sleep(Duration::from_millis(5));
        let evicted = store.sweep();
        assert_eq!(evicted, vec![cold, alert]);
    }

    #[test]
    fn backlog_counts_enqueued_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _fast, _rx) = test_store(dir.path());
        let key = SeriesKey::new("BTCUSDT", "1m");

        assert_eq!(store.flush_backlog(), 0);
        store.put_bars(&key, vec![bar(0, 1.0)]);
        store.put_bars(&key, vec![bar(60_000, 2.0)]);
        assert_eq!(store.flush_backlog(), 2);
    }
}
