// =============================================================================
// Runtime Configuration — Hot-reloadable cache settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian market cache. Every tunable that
// the original change log flags as subject to recalibration (gap factor, TTL
// values, minimum history depth, retry budgets) lives here instead of as a
// literal in the code.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{interval_ms, MarketState};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_intervals() -> Vec<String> {
    vec![
        "1m".to_string(),
        "5m".to_string(),
        "15m".to_string(),
        "1h".to_string(),
    ]
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_min_history_rows() -> usize {
    200
}

fn default_tail_window() -> usize {
    50
}

fn default_gap_factor() -> f64 {
    1.5
}

fn default_stale_after_bars() -> f64 {
    3.0
}

fn default_hot_ttl_secs() -> u64 {
    300
}

fn default_warm_ttl_secs() -> u64 {
    3_600
}

fn default_warm_threshold_ms() -> i64 {
    3_600_000
}

fn default_retention_limit() -> usize {
    1_500
}

fn default_flush_queue_capacity() -> usize {
    1_024
}

fn default_flush_batch_min() -> usize {
    4
}

fn default_flush_batch_max() -> usize {
    64
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_shutdown_drain_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_initial_load_max_retries() -> u32 {
    5
}

fn default_initial_load_backoff_secs() -> u64 {
    5
}

fn default_qa_max_retries() -> u32 {
    2
}

fn default_warmup_rows() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

fn default_history_base_url() -> String {
    "https://api.binance.com".to_string()
}

// =============================================================================
// SessionPolicy
// =============================================================================

/// Market-session policy used by the backfill coordinator. Crypto venues run
/// 24/7 (`always_open`); session-bound venues declare UTC open/close hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(default = "default_true")]
    pub always_open: bool,

    /// UTC hour (0-23, inclusive) at which the session opens.
    #[serde(default)]
    pub open_hour_utc: u32,

    /// UTC hour (0-23, exclusive) at which the session closes.
    #[serde(default)]
    pub close_hour_utc: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            always_open: true,
            open_hour_utc: 0,
            close_hour_utc: 0,
        }
    }
}

impl SessionPolicy {
    /// Resolve the market state for the given UTC hour.
    pub fn market_state_at(&self, hour_utc: u32) -> MarketState {
        if self.always_open {
            return MarketState::Open;
        }
        let open = if self.open_hour_utc <= self.close_hour_utc {
            hour_utc >= self.open_hour_utc && hour_utc < self.close_hour_utc
        } else {
            // Session wraps midnight (e.g. 22 -> 6).
            hour_utc >= self.open_hour_utc || hour_utc < self.close_hour_utc
        };
        if open {
            MarketState::Open
        } else {
            MarketState::Closed
        }
    }

    /// Resolve the market state for the current wall clock.
    pub fn market_state_now(&self) -> MarketState {
        use chrono::Timelike;
        self.market_state_at(chrono::Utc::now().hour())
    }
}

// =============================================================================
// StoreProfile
// =============================================================================

/// TTL policy per timeframe class. Sub-hour series churn quickly and get the
/// short hot TTL; hourly-and-above series get the longer warm TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreProfile {
    #[serde(default = "default_hot_ttl_secs")]
    pub hot_ttl_secs: u64,

    #[serde(default = "default_warm_ttl_secs")]
    pub warm_ttl_secs: u64,

    /// Timeframe duration (ms) at or above which an interval is "warm".
    #[serde(default = "default_warm_threshold_ms")]
    pub warm_threshold_ms: i64,
}

impl Default for StoreProfile {
    fn default() -> Self {
        Self {
            hot_ttl_secs: default_hot_ttl_secs(),
            warm_ttl_secs: default_warm_ttl_secs(),
            warm_threshold_ms: default_warm_threshold_ms(),
        }
    }
}

impl StoreProfile {
    /// TTL in seconds for the given interval string. Unknown intervals fall
    /// into the warm class (they are derived, low-churn views).
    pub fn ttl_secs_for(&self, interval: &str) -> u64 {
        match interval_ms(interval) {
            Some(tf) if tf < self.warm_threshold_ms => self.hot_ttl_secs,
            _ => self.warm_ttl_secs,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian cache.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Universe -----------------------------------------------------------

    /// Symbols the cache tracks.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Tracked intervals. The smallest (by duration) is the warmup/base
    /// interval from which larger timeframes are materialized.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,

    // --- Tiers & retention --------------------------------------------------

    /// Directory holding one durable NDJSON snapshot per series.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Maximum bars retained per series in the volatile tiers.
    #[serde(default = "default_retention_limit")]
    pub retention_limit: usize,

    /// TTL policy per timeframe class.
    #[serde(default)]
    pub store_profile: StoreProfile,

    /// Interval between eviction sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // --- Write-behind flusher -----------------------------------------------

    #[serde(default = "default_flush_queue_capacity")]
    pub flush_queue_capacity: usize,

    #[serde(default = "default_flush_batch_min")]
    pub flush_batch_min: usize,

    #[serde(default = "default_flush_batch_max")]
    pub flush_batch_max: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Bound on the final synchronous drain at shutdown.
    #[serde(default = "default_shutdown_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,

    // --- History health -----------------------------------------------------

    /// Minimum rows a series needs before it is not `insufficient`.
    #[serde(default = "default_min_history_rows")]
    pub min_history_rows: usize,

    /// Number of most-recent bars inspected by the health analyzer.
    #[serde(default = "default_tail_window")]
    pub tail_window: usize,

    /// A step larger than `gap_factor * tf_ms` counts as a gap.
    #[serde(default = "default_gap_factor")]
    pub gap_factor: f64,

    /// A tail older than `stale_after_bars * tf_ms` is stale.
    #[serde(default = "default_stale_after_bars")]
    pub stale_after_bars: f64,

    /// Interval between health/backfill evaluation passes.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    // --- Cold start ---------------------------------------------------------

    #[serde(default = "default_initial_load_max_retries")]
    pub initial_load_max_retries: u32,

    #[serde(default = "default_initial_load_backoff_secs")]
    pub initial_load_backoff_secs: u64,

    #[serde(default = "default_qa_max_retries")]
    pub qa_max_retries: u32,

    /// Rows requested per series during warmup.
    #[serde(default = "default_warmup_rows")]
    pub warmup_rows: u32,

    // --- Feed boundary ------------------------------------------------------

    /// Upstream WebSocket URL for live bars. Empty disables the live source
    /// (cold-start and REST warmup still run).
    #[serde(default)]
    pub feed_url: String,

    /// Base URL of the REST history endpoint used for warmup/backfill.
    #[serde(default = "default_history_base_url")]
    pub history_base_url: String,

    // --- Session ------------------------------------------------------------

    #[serde(default)]
    pub session: SessionPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            intervals: default_intervals(),
            data_dir: default_data_dir(),
            retention_limit: default_retention_limit(),
            store_profile: StoreProfile::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            flush_queue_capacity: default_flush_queue_capacity(),
            flush_batch_min: default_flush_batch_min(),
            flush_batch_max: default_flush_batch_max(),
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_drain_timeout_secs: default_shutdown_drain_timeout_secs(),
            min_history_rows: default_min_history_rows(),
            tail_window: default_tail_window(),
            gap_factor: default_gap_factor(),
            stale_after_bars: default_stale_after_bars(),
            health_interval_secs: default_health_interval_secs(),
            initial_load_max_retries: default_initial_load_max_retries(),
            initial_load_backoff_secs: default_initial_load_backoff_secs(),
            qa_max_retries: default_qa_max_retries(),
            warmup_rows: default_warmup_rows(),
            feed_url: String::new(),
            history_base_url: default_history_base_url(),
            session: SessionPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// The smallest tracked interval by duration — the warmup/base interval.
    ///
    /// Falls back to the first configured interval when durations cannot be
    /// resolved (misconfigured interval strings).
    pub fn base_interval(&self) -> &str {
        self.intervals
            .iter()
            .min_by_key(|iv| interval_ms(iv).unwrap_or(i64::MAX))
            .map(String::as_str)
            .unwrap_or("1m")
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            intervals = ?config.intervals,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
