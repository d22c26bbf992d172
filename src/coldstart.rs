// =============================================================================
// ColdStartOrchestrator — startup state machine gating live consumers
// =============================================================================
//
// Sequences `initializing -> initial_load -> qa_history -> ready`. No
// external consumer may treat cached data as authoritative before `ready`;
// the orchestrator is the single writer of the global `ColdStartState` and
// publishes every transition through the shared status cell (which bumps the
// state version the WebSocket push watches).
//
// `initial_load` loops on itself with bounded backoff: each attempt inspects
// every configured series, publishes warmup/backfill commands for unhealthy
// ones, and re-checks depth after the feed boundary has had time to respond.
// Retry exhaustion escalates to `degraded`, unrecoverable failures to
// `error`. Shutdown mid-phase leaves the state untouched — never forced to
// `ready`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backfill::BackfillCoordinator;
use crate::config::{RuntimeConfig, SessionPolicy};
use crate::health::HistoryHealthAnalyzer;
use crate::materialize::TimeframeMaterializer;
use crate::store::TieredStore;
use crate::types::{Bar, ColdStartReport, ColdStartState, HistoryStatus, SeriesKey};

// ---------------------------------------------------------------------------
// Shared status cell
// ---------------------------------------------------------------------------

/// Shared view of the cold-start progress. The orchestrator is the only
/// writer; the status API and read gate only observe.
pub struct ColdStartStatus {
    state: RwLock<ColdStartState>,
    reports: RwLock<HashMap<SeriesKey, ColdStartReport>>,
    qa_context: RwLock<HashMap<SeriesKey, HistoryStatus>>,
}

impl ColdStartStatus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ColdStartState::Initializing),
            reports: RwLock::new(HashMap::new()),
            qa_context: RwLock::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> ColdStartState {
        *self.state.read()
    }

    /// Whether reads may be served as authoritative.
    pub fn is_ready(&self) -> bool {
        self.state() == ColdStartState::Ready
    }

    pub fn reports(&self) -> HashMap<SeriesKey, ColdStartReport> {
        self.reports.read().clone()
    }

    pub fn qa_context(&self) -> HashMap<SeriesKey, HistoryStatus> {
        self.qa_context.read().clone()
    }

    fn transition(&self, to: ColdStartState) {
        let mut state = self.state.write();
        if *state != to {
            info!(from = %*state, to = %to, "cold-start transition");
            *state = to;
        }
    }
}

impl Default for ColdStartStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// QA replay boundary
// ---------------------------------------------------------------------------

/// The downstream analytics collaborator that replays each series' historical
/// tail during `qa_history`. Critical failures abort the phase.
pub trait HistoryReplay: Send + Sync {
    fn replay(&self, key: &SeriesKey, bars: &[Bar]) -> anyhow::Result<()>;
}

/// Bundled replay implementation: re-validates the structural invariants the
/// store promises (strict ordering, no duplicates) over the full tail.
pub struct InvariantReplay;

impl HistoryReplay for InvariantReplay {
    fn replay(&self, key: &SeriesKey, bars: &[Bar]) -> anyhow::Result<()> {
        for pair in bars.windows(2) {
            if pair[1].open_time <= pair[0].open_time {
                anyhow::bail!(
                    "ordering invariant violated in {key}: {} then {}",
                    pair[0].open_time,
                    pair[1].open_time
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct ColdStartOrchestrator {
    store: Arc<TieredStore>,
    analyzer: Arc<HistoryHealthAnalyzer>,
    coordinator: Arc<BackfillCoordinator>,
    materializer: Arc<TimeframeMaterializer>,
    replay: Arc<dyn HistoryReplay>,
    status: Arc<ColdStartStatus>,

    universe: Vec<SeriesKey>,
    base_interval: String,
    min_history_rows: usize,
    retention_limit: usize,
    max_retries: u32,
    backoff: Duration,
    qa_max_retries: u32,
    session: SessionPolicy,
}

impl ColdStartOrchestrator {
    pub fn new(
        config: &RuntimeConfig,
        store: Arc<TieredStore>,
        analyzer: Arc<HistoryHealthAnalyzer>,
        coordinator: Arc<BackfillCoordinator>,
        materializer: Arc<TimeframeMaterializer>,
        replay: Arc<dyn HistoryReplay>,
        status: Arc<ColdStartStatus>,
    ) -> Self {
        let universe = config
            .symbols
            .iter()
            .flat_map(|sym| {
                config
                    .intervals
                    .iter()
                    .map(move |iv| SeriesKey::new(sym.clone(), iv.clone()))
            })
            .collect();

        Self {
            store,
            analyzer,
            coordinator,
            materializer,
            replay,
            status,
            universe,
            base_interval: config.base_interval().to_string(),
            min_history_rows: config.min_history_rows,
            retention_limit: config.retention_limit,
            max_retries: config.initial_load_max_retries,
            backoff: Duration::from_secs(config.initial_load_backoff_secs),
            qa_max_retries: config.qa_max_retries,
            session: config.session.clone(),
        }
    }

    /// Drive the state machine to `ready` (or `degraded`/`error`). Returns
    /// the final state. Shutdown mid-phase returns with the state unchanged.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ColdStartState {
        self.status.transition(ColdStartState::Initializing);
        self.build_inventory();

        self.status.transition(ColdStartState::InitialLoad);
        match self.initial_load(&mut shutdown).await {
            Phase::Done => {}
            Phase::Shutdown => return self.status.state(),
            Phase::Exhausted => {
                warn!("initial_load retry budget exhausted — degraded");
                self.status.transition(ColdStartState::Degraded);
                return self.status.state();
            }
        }

        self.status.transition(ColdStartState::QaHistory);
        match self.qa_history(&mut shutdown).await {
            Phase::Done => {
                self.status.transition(ColdStartState::Ready);
                info!("cold start complete — live consumers unblocked");
            }
            Phase::Shutdown => return self.status.state(),
            Phase::Exhausted => {
                error!("historical QA failed after retries — degraded");
                self.status.transition(ColdStartState::Degraded);
            }
        }
        self.status.state()
    }

    /// Startup inventory: promote durable snapshots into the hot tiers and
    /// record per-series reports.
    fn build_inventory(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        for key in &self.universe {
            let rows_on_disk = self.store.disk().row_count(key);
            // Promotes disk -> memory + fast cache as a side effect.
            let bars = self.store.get_df(key, self.retention_limit);
            let last_open_time = bars.last().map(|b| b.open_time);
            let report = ColdStartReport {
                rows_on_disk,
                rows_in_ram: self.store.rows_in_ram(key),
                last_open_time,
                age_seconds: last_open_time.map(|t| (now_ms - t) / 1_000),
                needs_backfill: bars.len() < self.min_history_rows,
            };
            info!(
                key = %key,
                rows_on_disk = report.rows_on_disk,
                rows_in_ram = report.rows_in_ram,
                needs_backfill = report.needs_backfill,
                "cold-start inventory"
            );
            self.status.reports.write().insert(key.clone(), report);
        }
    }

    async fn initial_load(&self, shutdown: &mut watch::Receiver<bool>) -> Phase {
        for attempt in 0..=self.max_retries {
            if *shutdown.borrow() {
                return Phase::Shutdown;
            }

            let market_state = self.session.market_state_now();
            let now_ms = chrono::Utc::now().timestamp_millis();
            let mut pending = 0usize;

            for key in &self.universe {
                // Derived intervals may be fillable locally before asking the
                // feed for anything.
                if key.interval != self.base_interval {
                    self.materializer
                        .get_or_materialize(&key.symbol, &key.interval, self.retention_limit);
                }

                let status = self.analyzer.compute_history_status(key, now_ms);
                self.refresh_report(key, now_ms);

                if self.store.rows_in_ram(key) < self.min_history_rows {
                    pending += 1;
                    self.coordinator.evaluate_and_publish(key, &status, market_state);
                }
            }

            if pending == 0 {
                info!(attempt, "initial load complete — all series at depth");
                return Phase::Done;
            }

            warn!(
                attempt,
                pending,
                max_retries = self.max_retries,
                "initial load incomplete — waiting for feed to answer warmup"
            );
            if self.wait_backoff(attempt, shutdown).await {
                return Phase::Shutdown;
            }
        }
        Phase::Exhausted
    }

    async fn qa_history(&self, shutdown: &mut watch::Receiver<bool>) -> Phase {
        for attempt in 0..=self.qa_max_retries {
            if *shutdown.borrow() {
                return Phase::Shutdown;
            }

            let now_ms = chrono::Utc::now().timestamp_millis();
            let mut failed = false;
            for key in &self.universe {
                let bars = self.store.get_df(key, self.retention_limit);
                match self.replay.replay(key, &bars) {
                    Ok(()) => {
                        let status = self.analyzer.compute_history_status(key, now_ms);
                        self.status.qa_context.write().insert(key.clone(), status);
                    }
                    Err(e) => {
                        error!(key = %key, attempt, error = %e, "historical QA replay failed");
                        failed = true;
                        break;
                    }
                }
            }

            if !failed {
                info!(series = self.universe.len(), "historical QA complete");
                return Phase::Done;
            }
            if self.wait_backoff(attempt, shutdown).await {
                return Phase::Shutdown;
            }
        }
        Phase::Exhausted
    }

    fn refresh_report(&self, key: &SeriesKey, now_ms: i64) {
        let rows_in_ram = self.store.rows_in_ram(key);
        let last_open_time = self.store.get_last(key).map(|b| b.open_time);
        let report = ColdStartReport {
            rows_on_disk: self.store.disk().row_count(key),
            rows_in_ram,
            last_open_time,
            age_seconds: last_open_time.map(|t| (now_ms - t) / 1_000),
            needs_backfill: rows_in_ram < self.min_history_rows,
        };
        self.status.reports.write().insert(key.clone(), report);
    }

    /// Linear backoff between attempts; returns `true` on shutdown.
    async fn wait_backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff * (attempt + 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.changed() => *shutdown.borrow(),
        }
    }
}

enum Phase {
    Done,
    Shutdown,
    Exhausted,
}

// =============================================================================
// Tests
// =============================================================================
