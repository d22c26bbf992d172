// =============================================================================
// Shared types used across the Meridian market-data cache
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Bars & series identity
// ---------------------------------------------------------------------------

/// A single OHLCV bar. `open_time` (ms since epoch) is the identity of a bar
/// within a `(symbol, interval)` series; bars are immutable once persisted
/// except for replace-by-dedup on re-ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Composite key that identifies a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Whether `s` is safe to use as a series identity component. Symbols and
/// intervals end up in durable snapshot file names, so only ASCII
/// alphanumerics pass.
pub fn valid_series_component(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Nominal duration of one bar for `interval`, in milliseconds.
///
/// Returns `None` for interval strings the cache does not understand; callers
/// treat an unknown interval as a materialization target only.
pub fn interval_ms(interval: &str) -> Option<i64> {
    if interval.len() < 2 {
        return None;
    }
    let (num, unit) = interval.split_at(interval.len() - 1);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

// ---------------------------------------------------------------------------
// Eviction priority
// ---------------------------------------------------------------------------

/// Eviction priority for a cache entry. Total ordering: `Cold` entries are
/// evicted first under capacity pressure, `Alert`-pinned entries last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Cold,
    Normal,
    Alert,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cold => write!(f, "Cold"),
            Self::Normal => write!(f, "Normal"),
            Self::Alert => write!(f, "Alert"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market session
// ---------------------------------------------------------------------------

/// Whether the venue is currently trading. Routine backfill requests are
/// suppressed on closed markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    Open,
    Closed,
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// History health
// ---------------------------------------------------------------------------

/// Classification of a series tail. First matching condition wins, evaluated
/// in the order the variants are declared (see health.rs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryState {
    Insufficient,
    StaleTail,
    NonMonotonicTail,
    GappyTail,
    Ok,
}

impl HistoryState {
    /// Reason string carried on outbound backfill commands.
    pub fn as_reason(&self) -> &'static str {
        match self {
            Self::Insufficient => "insufficient",
            Self::StaleTail => "stale_tail",
            Self::NonMonotonicTail => "non_monotonic_tail",
            Self::GappyTail => "gappy_tail",
            Self::Ok => "ok",
        }
    }
}

impl std::fmt::Display for HistoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_reason())
    }
}

/// Health report for one series, produced fresh on every analysis pass.
/// Diagnostic counters are always populated, even when a higher-priority
/// state (e.g. a stale tail) masks the gap classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryStatus {
    pub state: HistoryState,
    pub gaps_count: u32,
    pub max_gap_ms: i64,
    pub non_monotonic_count: u32,
    pub last_open_time: Option<i64>,
    pub age_seconds: Option<i64>,
    pub needs_backfill: bool,
}

// ---------------------------------------------------------------------------
// Backfill commands
// ---------------------------------------------------------------------------

/// Outbound request kind: warmup populates the smallest tracked interval,
/// backfill repairs a derived/larger interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Warmup,
    Backfill,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warmup => write!(f, "warmup"),
            Self::Backfill => write!(f, "backfill"),
        }
    }
}

/// Gap diagnostics attached to a command when the tail is gappy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapDiagnostics {
    pub gaps_count: u32,
    pub max_gap_ms: i64,
}

/// A pure request published to the feed adapter's command channel. The
/// coordinator never fetches history itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillCommand {
    pub id: String,
    pub symbol: String,
    pub interval: String,
    pub command: CommandKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<GapDiagnostics>,
}

// ---------------------------------------------------------------------------
// Cold start
// ---------------------------------------------------------------------------

/// Global startup phase. Transitions only move forward, except for bounded
/// retry loops back into `InitialLoad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartState {
    Initializing,
    InitialLoad,
    QaHistory,
    Ready,
    Degraded,
    Error,
}

impl std::fmt::Display for ColdStartState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::InitialLoad => "initial_load",
            Self::QaHistory => "qa_history",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Per-series inventory built at startup and refreshed during initial load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdStartReport {
    pub rows_on_disk: usize,
    pub rows_in_ram: usize,
    pub last_open_time: Option<i64>,
    pub age_seconds: Option<i64>,
    pub needs_backfill: bool,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Closed error taxonomy for the cache core. Ingestion-path errors are always
/// recovered locally; only orchestrator-level failures become operator-visible
/// through the status interface.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Fast-cache or disk temporarily unreachable; retried in the background.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Malformed bar or failed signature check; the offending bar is dropped.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// A series has not yet reached the minimum required history depth.
    #[error("insufficient history for {key}: {rows} rows, need {required}")]
    InsufficientHistory {
        key: SeriesKey,
        rows: usize,
        required: usize,
    },

    /// Repeated durable-write failure; the store keeps serving from volatile
    /// tiers in degraded-durability mode.
    #[error("critical persistence failure: {0}")]
    CriticalPersistence(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_ms_known_values() {
        assert_eq!(interval_ms("1m"), Some(60_000));
        assert_eq!(interval_ms("5m"), Some(300_000));
        assert_eq!(interval_ms("15m"), Some(900_000));
        assert_eq!(interval_ms("1h"), Some(3_600_000));
        assert_eq!(interval_ms("4h"), Some(14_400_000));
        assert_eq!(interval_ms("1d"), Some(86_400_000));
    }

    #[test]
    fn interval_ms_rejects_garbage() {
        assert_eq!(interval_ms(""), None);
        assert_eq!(interval_ms("m"), None);
        assert_eq!(interval_ms("0m"), None);
        assert_eq!(interval_ms("-5m"), None);
        assert_eq!(interval_ms("5x"), None);
    }

    #[test]
    fn series_component_validation() {
        assert!(valid_series_component("BTCUSDT"));
        assert!(valid_series_component("1m"));
        assert!(!valid_series_component(""));
        assert!(!valid_series_component("../X"));
        assert!(!valid_series_component("BTC/USDT"));
        assert!(!valid_series_component("BTC USDT"));
    }

    #[test]
    fn priority_eviction_ordering() {
        assert!(Priority::Cold < Priority::Normal);
        assert!(Priority::Normal < Priority::Alert);
    }

    #[test]
    fn series_key_display() {
        let key = SeriesKey::new("BTCUSDT", "1m");
        assert_eq!(key.to_string(), "BTCUSDT@1m");
    }

    #[test]
    fn history_state_reason_strings() {
        assert_eq!(HistoryState::GappyTail.as_reason(), "gappy_tail");
        assert_eq!(HistoryState::StaleTail.as_reason(), "stale_tail");
        assert_eq!(HistoryState::Insufficient.as_reason(), "insufficient");
    }

    #[test]
    fn cold_start_state_serialises_snake_case() {
        let json = serde_json::to_string(&ColdStartState::InitialLoad).unwrap();
        assert_eq!(json, "\"initial_load\"");
    }
}
