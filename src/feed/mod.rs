// =============================================================================
// Feed boundary — inbound bar ingestion and outbound history requests
// =============================================================================

pub mod history;
pub mod message;
pub mod ws_source;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backfill::BackfillCoordinator;
use crate::config::SessionPolicy;
use crate::health::HistoryHealthAnalyzer;
use crate::store::TieredStore;
use crate::types::CacheError;

pub use history::HistoryClient;
pub use message::{parse_batch, sign_batch, BarBatch};

/// Outcome of one ingested frame.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub merged: usize,
    pub replaced: usize,
    pub dropped: usize,
}

/// The ingestion pipeline behind the live feed: parse, merge into the store,
/// then re-check the series' tail and publish a repair command if warranted.
///
/// Ingestion never blocks on persistence or on the command channel, and a bad
/// frame never takes the pipeline down.
pub struct FeedIngest {
    store: Arc<TieredStore>,
    analyzer: Arc<HistoryHealthAnalyzer>,
    coordinator: Arc<BackfillCoordinator>,
    session: SessionPolicy,
    secret: Option<String>,
}

impl FeedIngest {
    pub fn new(
        store: Arc<TieredStore>,
        analyzer: Arc<HistoryHealthAnalyzer>,
        coordinator: Arc<BackfillCoordinator>,
        session: SessionPolicy,
        secret: Option<String>,
    ) -> Self {
        Self {
            store,
            analyzer,
            coordinator,
            session,
            secret,
        }
    }

    /// Ingest one raw feed frame.
    pub fn apply(&self, text: &str) -> Result<IngestOutcome, CacheError> {
        let batch = parse_batch(text, self.secret.as_deref())?;
        if batch.bars.len() + batch.dropped == 0 {
            debug!(key = %batch.key, "empty batch ignored");
            return Ok(IngestOutcome::default());
        }

        let merged = batch.bars.len();
        let replaced = self.store.put_bars(&batch.key, batch.bars);

        if batch.dropped > 0 {
            warn!(key = %batch.key, dropped = batch.dropped, "batch contained malformed bars");
        }
        debug!(key = %batch.key, merged, replaced, "batch ingested");

        // Post-ingest tail check; an unhealthy tail emits at most one command.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let status = self.analyzer.compute_history_status(&batch.key, now_ms);
        self.coordinator
            .evaluate_and_publish(&batch.key, &status, self.session.market_state_now());

        Ok(IngestOutcome {
            merged,
            replaced,
            dropped: batch.dropped,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreProfile;
    use crate::health::HealthParams;
    use crate::store::{DiskTier, InProcessFastCache};
    use crate::types::{Bar, SeriesKey};
    use tokio::sync::mpsc;

    fn ingest_fixture(
        dir: &std::path::Path,
        secret: Option<String>,
    ) -> (
        Arc<TieredStore>,
        FeedIngest,
        mpsc::Receiver<crate::types::BackfillCommand>,
    ) {
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir));
        let (store, _rx, _backlog) =
            TieredStore::new(fast, disk, StoreProfile::default(), 1_500, 256);
        let store = Arc::new(store);
        let analyzer = Arc::new(HistoryHealthAnalyzer::new(
            store.clone(),
            HealthParams {
                min_history_rows: 2,
                tail_window: 50,
                gap_factor: 1.5,
                stale_after_bars: 1e12, // never stale in tests
            },
        ));
        let (tx, rx) = mpsc::channel(8);
        let coordinator = Arc::new(BackfillCoordinator::new("1m", tx));
        let ingest = FeedIngest::new(
            store.clone(),
            analyzer,
            coordinator,
            SessionPolicy::default(),
            secret,
        );
        (store, ingest, rx)
    }

    fn fresh_frame(count: usize) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let start = now - now.rem_euclid(60_000) - (count as i64) * 60_000;
        let bars: Vec<String> = (0..count as i64)
            .map(|i| {
                let t = start + i * 60_000;
                format!(
                    "{{\"open_time\":{t},\"close_time\":{},\"open\":1,\"high\":2,\"low\":0.5,\"close\":1.5,\"volume\":3}}",
                    t + 59_999
                )
            })
            .collect();
        format!(
            "{{\"symbol\":\"BTCUSDT\",\"interval\":\"1m\",\"bars\":[{}]}}",
            bars.join(",")
        )
    }

    #[test]
    fn healthy_batch_lands_without_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ingest, mut rx) = ingest_fixture(dir.path(), None);

        let outcome = ingest.apply(&fresh_frame(10)).unwrap();
        assert_eq!(outcome.merged, 10);
        assert_eq!(outcome.dropped, 0);
        assert_eq!(store.rows_in_ram(&SeriesKey::new("BTCUSDT", "1m")), 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn thin_history_triggers_warmup_command() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, ingest, mut rx) = ingest_fixture(dir.path(), None);

        ingest.apply(&fresh_frame(1)).unwrap();
        let cmd = rx.try_recv().unwrap();
        assert_eq!(cmd.command, crate::types::CommandKind::Warmup);
        assert_eq!(cmd.reason, "insufficient");
    }

    #[test]
    fn forged_frame_is_rejected_and_nothing_lands() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ingest, _rx) = ingest_fixture(dir.path(), Some("secret".to_string()));

        assert!(ingest.apply(&fresh_frame(5)).is_err());
        assert_eq!(store.rows_in_ram(&SeriesKey::new("BTCUSDT", "1m")), 0);
    }

    #[test]
    fn signed_frame_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ingest, _rx) = ingest_fixture(dir.path(), Some("secret".to_string()));

        let bars = vec![
            Bar {
                open_time: 0,
                close_time: 59_999,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 3.0,
            },
            Bar {
                open_time: 60_000,
                close_time: 119_999,
                open: 1.5,
                high: 2.5,
                low: 1.0,
                close: 2.0,
                volume: 4.0,
            },
        ];
        let sig = sign_batch("secret", "BTCUSDT", "1m", &bars);
        let frame = format!(
            "{{\"symbol\":\"BTCUSDT\",\"interval\":\"1m\",\"bars\":{},\"signature\":\"{sig}\"}}",
            serde_json::to_string(&bars).unwrap()
        );

        let outcome = ingest.apply(&frame).unwrap();
        assert_eq!(outcome.merged, 2);
        assert_eq!(store.rows_in_ram(&SeriesKey::new("BTCUSDT", "1m")), 2);
    }
}
