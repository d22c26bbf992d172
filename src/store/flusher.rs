// =============================================================================
// WriteBehindFlusher — asynchronous durable persistence for the store
// =============================================================================
//
// Consumes the FIFO queue of pending snapshot-write requests enqueued by
// `TieredStore`. Batch size adapts to backlog depth: a growing backlog drains
// larger batches per cycle to catch up, a shallow one runs small batches to
// minimise staleness. Duplicate keys inside one drained batch are coalesced
// so each series is written at most once per cycle, always from its newest
// snapshot.
//
// On shutdown the flusher performs one final synchronous drain of the entire
// queue within a bounded timeout; anything still pending after the deadline
// is logged as a data-loss risk, never silently ignored.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::store::disk::DiskTier;
use crate::store::tiered::TieredStore;
use crate::types::{Bar, SeriesKey};

/// Consecutive write failures before the store is flagged as running in
/// degraded durability.
const CRITICAL_FAILURE_THRESHOLD: u32 = 3;

/// One pending durable write. `snapshot` is normally `None` — the flusher
/// reads the series' current state at drain time, which coalesces rapid
/// updates for free. Eviction enqueues a captured snapshot because the memory
/// entry is gone by the time the flusher runs.
#[derive(Debug)]
pub struct FlushRequest {
    pub key: SeriesKey,
    pub snapshot: Option<Vec<Bar>>,
}

/// Destination of durable snapshot writes. `DiskTier` in production; tests
/// inject slow or failing sinks.
pub trait SnapshotSink: Send + Sync {
    fn write_snapshot(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()>;
}

impl SnapshotSink for DiskTier {
    fn write_snapshot(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()> {
        DiskTier::write_snapshot(self, key, bars)
    }
}

/// Drains the store's flush queue to the durable tier.
pub struct WriteBehindFlusher {
    store: Arc<TieredStore>,
    sink: Arc<dyn SnapshotSink>,
    rx: mpsc::Receiver<FlushRequest>,
    backlog: Arc<AtomicUsize>,
    batch_min: usize,
    batch_max: usize,
    cycle_interval: Duration,
    drain_timeout: Duration,
    consecutive_failures: u32,
}

impl WriteBehindFlusher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TieredStore>,
        sink: Arc<dyn SnapshotSink>,
        rx: mpsc::Receiver<FlushRequest>,
        backlog: Arc<AtomicUsize>,
        batch_min: usize,
        batch_max: usize,
        cycle_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            rx,
            backlog,
            batch_min: batch_min.max(1),
            batch_max: batch_max.max(batch_min.max(1)),
            cycle_interval,
            drain_timeout,
            consecutive_failures: 0,
        }
    }

    /// Run until the shutdown signal flips, then perform the final bounded
    /// drain. Returns the number of requests still pending after the drain
    /// (0 on a clean shutdown).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.cycle_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_cycle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(pending = self.backlog.load(Ordering::SeqCst), "flusher shutting down — final drain");
        self.final_drain().await
    }

    /// Drain one adaptive batch: batch size tracks the backlog depth, clamped
    /// to the configured bounds.
    pub fn drain_cycle(&mut self) -> usize {
        let backlog = self.backlog.load(Ordering::SeqCst);
        if backlog == 0 {
            return 0;
        }
        let batch_size = backlog.clamp(self.batch_min, self.batch_max);
        self.drain_up_to(batch_size)
    }

    fn drain_up_to(&mut self, batch_size: usize) -> usize {
        // Collect the batch FIFO, coalescing duplicate keys (newest request
        // wins so an eviction snapshot is not overwritten by a stale None).
        let mut batch: Vec<FlushRequest> = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match self.rx.try_recv() {
                Ok(req) => {
                    self.backlog.fetch_sub(1, Ordering::SeqCst);
                    if let Some(existing) =
                        batch.iter_mut().find(|r| r.key == req.key)
                    {
                        *existing = req;
                    } else {
                        batch.push(req);
                    }
                }
                Err(_) => break,
            }
        }

        let mut written = 0;
        for req in batch {
            if self.flush_one(req) {
                written += 1;
            }
        }
        written
    }

    /// Write one series snapshot. Returns `true` on success.
    fn flush_one(&mut self, req: FlushRequest) -> bool {
        let bars = match &req.snapshot {
            Some(bars) => Some(bars.clone()),
            None => self.store.snapshot_for(&req.key),
        };
        let Some(bars) = bars else {
            // Evicted between enqueue and drain with nothing captured; the
            // previous durable snapshot remains the best we have.
            debug!(key = %req.key, "no snapshot available for flush request — skipping");
            return false;
        };

        match self.sink.write_snapshot(&req.key, &bars) {
            Ok(()) => {
                self.consecutive_failures = 0;
                if self.store.is_degraded_durability() {
                    info!("durable writes recovered — leaving degraded durability");
                    self.store.set_degraded_durability(false);
                }
                true
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    key = %req.key,
                    error = %e,
                    failures = self.consecutive_failures,
                    "durable write failed"
                );
                if self.consecutive_failures >= CRITICAL_FAILURE_THRESHOLD
                    && !self.store.is_degraded_durability()
                {
                    error!(
                        failures = self.consecutive_failures,
                        "repeated durable-write failures — store now memory+fast-cache only"
                    );
                    self.store.set_degraded_durability(true);
                }
                // Re-enqueue the whole request so the retry still has an
                // eviction-captured snapshot once the tier recovers.
                self.store.requeue_flush(req);
                false
            }
        }
    }

    /// Drain everything still pending, bounded by the configured timeout.
    /// Returns the leftover count.
    pub async fn final_drain(&mut self) -> usize {
        let deadline = Instant::now() + self.drain_timeout;
        while self.backlog.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                break;
            }
            if self.drain_up_to(self.batch_max) == 0 {
                // Nothing written this pass (failures re-enqueue); avoid a
                // hot spin against a dead sink.
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        let leftover = self.backlog.load(Ordering::SeqCst);
        if leftover > 0 {
            error!(
                leftover,
                timeout_secs = self.drain_timeout.as_secs(),
                "shutdown drain timed out with pending durable writes — DATA LOSS RISK"
            );
        } else {
            info!("shutdown drain complete — no pending durable writes");
        }
        leftover
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreProfile;
    use crate::store::fast_cache::InProcessFastCache;
    use crate::types::Bar;

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

    fn build(
        dir: &std::path::Path,
        sink: Arc<dyn SnapshotSink>,
    ) -> (Arc<TieredStore>, WriteBehindFlusher, Arc<DiskTier>) {
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir));
        let (store, rx, backlog) = TieredStore::new(
            fast,
            disk.clone(),
            StoreProfile::default(),
            1_500,
            256,
        );
        let store = Arc::new(store);
        let flusher = WriteBehindFlusher::new(
            store.clone(),
            sink,
            rx,
            backlog,
            2,
            16,
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        (store, flusher, disk)
    }

    /// Sink that sleeps per write — slow but finite.
    struct SlowSink {
        inner: DiskTier,
        delay: Duration,
    }

    impl SnapshotSink for SlowSink {
        fn write_snapshot(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.write_snapshot(key, bars)
        }
    }

    /// Sink that fails the first `failures_left` writes, then recovers.
    struct FlakySink {
        inner: DiskTier,
        failures_left: AtomicUsize,
    }

    impl SnapshotSink for FlakySink {
        fn write_snapshot(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("sink offline")
            }
            self.inner.write_snapshot(key, bars)
        }
    }

    /// Sink that always fails.
    struct DeadSink;

    impl SnapshotSink for DeadSink {
        fn write_snapshot(&self, _key: &SeriesKey, _bars: &[Bar]) -> Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[test]
    fn drain_cycle_writes_snapshots_and_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let disk_sink = Arc::new(DiskTier::new(dir.path()));
        let (store, mut flusher, disk) = build(dir.path(), disk_sink);
        let key = SeriesKey::new("BTCUSDT", "1m");

        // Three puts -> three queued requests for the same series.
        store.put_bars(&key, vec![bar(0, 1.0)]);
        store.put_bars(&key, vec![bar(60_000, 2.0)]);
        store.put_bars(&key, vec![bar(120_000, 3.0)]);
        assert_eq!(store.flush_backlog(), 3);

        // One cycle coalesces them into a single write of the newest state.
        let written = flusher.drain_up_to(16);
        assert_eq!(written, 1);
        assert_eq!(store.flush_backlog(), 0);
        assert_eq!(disk.read_snapshot(&key).unwrap().unwrap().len(), 3);
    }

    #[test]
    fn adaptive_batch_tracks_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(DiskTier::new(dir.path()));
        let (store, mut flusher, _disk) = build(dir.path(), sink);

        // Shallow backlog -> min batch.
        store.put_bars(&SeriesKey::new("A", "1m"), vec![bar(0, 1.0)]);
        assert_eq!(flusher.drain_cycle(), 1);

        // Deep backlog across many series -> larger batches per cycle.
        for i in 0..20 {
            store.put_bars(&SeriesKey::new(format!("SYM{i}"), "1m"), vec![bar(0, 1.0)]);
        }
        let written = flusher.drain_cycle();
        assert_eq!(written, 16); // clamped at batch_max
        assert_eq!(store.flush_backlog(), 4);
    }

    #[test]
    fn repeated_failures_flag_degraded_durability() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut flusher, _disk) = build(dir.path(), Arc::new(DeadSink));
        let key = SeriesKey::new("BTCUSDT", "1m");

        store.put_bars(&key, vec![bar(0, 1.0)]);
        assert!(!store.is_degraded_durability());

        // Each failed attempt re-enqueues; three attempts trip the flag.
        for _ in 0..3 {
            flusher.drain_up_to(16);
        }
        assert!(store.is_degraded_durability());

        // Reads and writes keep working.
        store.put_bars(&key, vec![bar(60_000, 2.0)]);
        assert_eq!(store.get_df(&key, 10).len(), 2);
    }

    #[test]
    fn eviction_snapshot_survives_a_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir.path()));
        // Zero TTLs: the sweep evicts immediately.
        let profile = StoreProfile {
            hot_ttl_secs: 0,
            warm_ttl_secs: 0,
            ..StoreProfile::default()
        };
        let (store, rx, backlog) = TieredStore::new(fast, disk.clone(), profile, 1_500, 256);
        let store = Arc::new(store);
        let flaky = Arc::new(FlakySink {
            inner: DiskTier::new(dir.path()),
            failures_left: AtomicUsize::new(1),
        });
        let mut flusher = WriteBehindFlusher::new(
            store.clone(),
            flaky,
            rx,
            backlog,
            2,
            16,
            Duration::from_millis(50),
            Duration::from_secs(5),
        );

        let key = SeriesKey::new("BTCUSDT", "1m");
        store.put_bars(&key, vec![bar(0, 1.0), bar(60_000, 2.0)]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep(), vec![key.clone()]);
        assert_eq!(store.rows_in_ram(&key), 0);

        // First drain coalesces down to the eviction-captured request and
        // hits the failing sink.
        assert_eq!(flusher.drain_up_to(16), 0);
        assert!(disk.read_snapshot(&key).unwrap().is_none());

        // The retry must still carry the captured snapshot — the memory
        // entry is gone, so re-reading the store would find nothing.
        assert_eq!(flusher.drain_up_to(16), 1);
        assert_eq!(disk.read_snapshot(&key).unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_drain_empties_queue_with_slow_sink() {
        let dir = tempfile::tempdir().unwrap();
        let slow = Arc::new(SlowSink {
            inner: DiskTier::new(dir.path()),
            delay: Duration::from_millis(10),
        });
        let (store, mut flusher, disk) = build(dir.path(), slow);

        for i in 0..10 {
            store.put_bars(&SeriesKey::new(format!("SYM{i}"), "1m"), vec![bar(0, 1.0)]);
        }
        assert_eq!(store.flush_backlog(), 10);

        let leftover = flusher.final_drain().await;
        assert_eq!(leftover, 0);
        assert_eq!(store.flush_backlog(), 0);
        assert_eq!(
            disk.read_snapshot(&SeriesKey::new("SYM9", "1m"))
                .unwrap()
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_drain_reports_leftover_on_dead_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (store, flusher, _disk) = build(dir.path(), Arc::new(DeadSink));
        let mut flusher = WriteBehindFlusher {
            drain_timeout: Duration::from_millis(100),
            ..flusher
        };
        let key = SeriesKey::new("BTCUSDT", "1m");
        store.put_bars(&key, vec![bar(0, 1.0)]);

        let leftover = flusher.final_drain().await;
        assert!(leftover > 0);
    }

    #[tokio::test]
    async fn run_drains_then_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(DiskTier::new(dir.path()));
        let (store, flusher, disk) = build(dir.path(), sink);
        let key = SeriesKey::new("BTCUSDT", "1m");
        store.put_bars(&key, vec![bar(0, 1.0)]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(flusher.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();

        let leftover = handle.await.unwrap();
        assert_eq!(leftover, 0);
        assert!(disk.read_snapshot(&key).unwrap().unwrap().len() == 1);
    }
}
