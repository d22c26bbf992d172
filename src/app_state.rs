// =============================================================================
// Central Application State — Meridian market-data cache
// =============================================================================
//
// The single source of truth for the service. All subsystems hold Arc
// references to their own state; AppState ties them together and provides a
// unified snapshot for the status API and WebSocket push feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for all mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::coldstart::ColdStartStatus;
use crate::config::RuntimeConfig;
use crate::health::HistoryHealthAnalyzer;
use crate::materialize::TimeframeMaterializer;
use crate::store::TieredStore;
use crate::types::{Bar, ColdStartReport, ColdStartState, HistoryStatus, SeriesKey};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the status error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation. The WebSocket feed uses this to detect
    /// changes and push updates.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Cache core ──────────────────────────────────────────────────────
    pub store: Arc<TieredStore>,
    pub materializer: Arc<TimeframeMaterializer>,
    pub analyzer: Arc<HistoryHealthAnalyzer>,

    // ── Cold start ──────────────────────────────────────────────────────
    pub cold_start: Arc<ColdStartStatus>,

    // ── Health ──────────────────────────────────────────────────────────
    /// Latest classification per series, refreshed by the health timer.
    pub health_reports: RwLock<HashMap<SeriesKey, HistoryStatus>>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    /// Instant when the service was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        store: Arc<TieredStore>,
        materializer: Arc<TimeframeMaterializer>,
        analyzer: Arc<HistoryHealthAnalyzer>,
        cold_start: Arc<ColdStartStatus>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            runtime_config: config,
            store,
            materializer,
            analyzer,
            cold_start,
            health_reports: RwLock::new(HashMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Atomically increment the state version. Call this after every
    /// meaningful mutation to signal WebSocket clients that fresh data is
    /// available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Read the current state version without modifying it.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Serve a bar read, deriving from the base chain when needed. The
    /// `authoritative` flag is false until cold start reaches `ready`.
    pub fn read_bars(&self, symbol: &str, interval: &str, limit: usize) -> BarsResponse {
        let bars = self.materializer.get_or_materialize(symbol, interval, limit);
        BarsResponse {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            authoritative: self.cold_start.is_ready(),
            count: bars.len(),
            bars,
        }
    }

    // ── Health bookkeeping ──────────────────────────────────────────────

    /// Store the latest classification for `key`, bumping the version when
    /// the state actually changed.
    pub fn record_health(&self, key: SeriesKey, status: HistoryStatus) {
        let changed = {
            let mut reports = self.health_reports.write();
            let changed = reports
                .get(&key)
                .map(|prev| prev.state != status.state)
                .unwrap_or(true);
            reports.insert(key, status);
            changed
        };
        if changed {
            self.increment_version();
        }
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted when the limit is
    /// reached.
    pub fn push_error(&self, msg: String) {
        let record = ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the service state.
    ///
    /// This is the payload of `GET /api/v1/status` and the WebSocket push
    /// feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.runtime_config.read();
        let version = self.current_state_version();
        let cold_start_state = self.cold_start.state();

        let health = self
            .health_reports
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<HashMap<_, _>>();

        let mut series = HashMap::new();
        for symbol in &config.symbols {
            for interval in &config.intervals {
                let key = SeriesKey::new(symbol.clone(), interval.clone());
                series.insert(
                    key.to_string(),
                    SeriesSnapshot {
                        rows_in_ram: self.store.rows_in_ram(&key),
                        rows_on_disk: self.store.disk().row_count(&key),
                        last_open_time: self.store.get_last(&key).map(|b| b.open_time),
                    },
                );
            }
        }

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cold_start: cold_start_state,
            authoritative: cold_start_state == ColdStartState::Ready,
            store: StoreSnapshot {
                flush_backlog: self.store.flush_backlog(),
                degraded_durability: self.store.is_degraded_durability(),
            },
            series,
            health,
            cold_start_reports: self
                .cold_start
                .reports()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            symbols: config.symbols.clone(),
            intervals: config.intervals.clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Response body for a bar read.
#[derive(Debug, Clone, Serialize)]
pub struct BarsResponse {
    pub symbol: String,
    pub interval: String,
    /// False while cold start has not reached `ready`.
    pub authoritative: bool,
    pub count: usize,
    pub bars: Vec<Bar>,
}

/// Full service state snapshot sent to operators.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub cold_start: ColdStartState,
    pub authoritative: bool,
    pub store: StoreSnapshot,
    pub series: HashMap<String, SeriesSnapshot>,
    pub health: HashMap<String, HistoryStatus>,
    pub cold_start_reports: HashMap<String, ColdStartReport>,
    pub symbols: Vec<String>,
    pub intervals: Vec<String>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Store-level operational counters.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub flush_backlog: usize,
    pub degraded_durability: bool,
}

/// Per-series inventory line in the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub rows_in_ram: usize,
    pub rows_on_disk: usize,
    pub last_open_time: Option<i64>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthParams;
    use crate::store::{DiskTier, InProcessFastCache};
    use crate::types::HistoryState;

    fn state_fixture(dir: &std::path::Path) -> AppState {
        let config = RuntimeConfig {
            symbols: vec!["BTCUSDT".to_string()],
            intervals: vec!["1m".to_string()],
            ..RuntimeConfig::default()
        };
        let fast = Arc::new(InProcessFastCache::new());
        let disk = Arc::new(DiskTier::new(dir));
        let (store, _rx, _backlog) = TieredStore::new(
            fast,
            disk,
            config.store_profile.clone(),
            config.retention_limit,
            256,
        );
        let store = Arc::new(store);
        let materializer = Arc::new(TimeframeMaterializer::new(store.clone(), "1m", 1.5));
        let analyzer = Arc::new(HistoryHealthAnalyzer::new(
            store.clone(),
            HealthParams {
                min_history_rows: 1,
                tail_window: 50,
                gap_factor: 1.5,
                stale_after_bars: 3.0,
            },
        ));
        AppState::new(
            Arc::new(RwLock::new(config)),
            store,
            materializer,
            analyzer,
            Arc::new(ColdStartStatus::new()),
        )
    }

    fn healthy_status() -> HistoryStatus {
        HistoryStatus {
            state: HistoryState::Ok,
            gaps_count: 0,
            max_gap_ms: 0,
            non_monotonic_count: 0,
            last_open_time: Some(0),
            age_seconds: Some(1),
            needs_backfill: false,
        }
    }

    #[test]
    fn reads_are_not_authoritative_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_fixture(dir.path());

        let resp = state.read_bars("BTCUSDT", "1m", 10);
        assert!(!resp.authoritative);

        let snapshot = state.build_snapshot();
        assert!(!snapshot.authoritative);
        assert_eq!(snapshot.cold_start, ColdStartState::Initializing);
    }

    #[test]
    fn health_change_bumps_version_repeat_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_fixture(dir.path());
        let key = SeriesKey::new("BTCUSDT", "1m");

        let v0 = state.current_state_version();
        state.record_health(key.clone(), healthy_status());
        let v1 = state.current_state_version();
        assert!(v1 > v0);

        // Same classification again: no version churn.
        state.record_health(key, healthy_status());
        assert_eq!(state.current_state_version(), v1);
    }

    #[test]
    fn error_log_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_fixture(dir.path());
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors.last().unwrap().message.ends_with("59"));
    }

    #[test]
    fn snapshot_lists_every_configured_series() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_fixture(dir.path());
        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.series.len(), 1);
        assert!(snapshot.series.contains_key("BTCUSDT@1m"));
        assert_eq!(snapshot.store.flush_backlog, 0);
        assert!(!snapshot.store.degraded_durability);
    }
}
