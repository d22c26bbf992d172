// =============================================================================
// BackfillCoordinator — turns tail health into outbound warmup/backfill requests
// =============================================================================
//
// Purely reactive and advisory: the coordinator reads health classifications
// and publishes at most one command per evaluation onto the feed adapter's
// command channel. It never fetches history itself and never blocks store
// ingestion (publish is try_send). Unanswered requests retry naturally on the
// next cycle because `needs_backfill` stays true until the tail heals.
// =============================================================================

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{
    BackfillCommand, CommandKind, GapDiagnostics, HistoryState, HistoryStatus, MarketState,
    SeriesKey,
};

pub struct BackfillCoordinator {
    /// The smallest tracked interval — requests for it are warmups, all
    /// other intervals get backfills.
    base_interval: String,
    command_tx: mpsc::Sender<BackfillCommand>,
}

impl BackfillCoordinator {
    pub fn new(base_interval: impl Into<String>, command_tx: mpsc::Sender<BackfillCommand>) -> Self {
        Self {
            base_interval: base_interval.into(),
            command_tx,
        }
    }

    /// Decide whether `status` warrants an outbound command. Pure — no I/O.
    ///
    /// Rules:
    /// * `ok` → nothing.
    /// * closed market suppresses routine requests; a genuinely insufficient
    ///   cold-start history is requested regardless of market state.
    /// * warmup for the base interval, backfill otherwise.
    pub fn evaluate(
        &self,
        key: &SeriesKey,
        status: &HistoryStatus,
        market_state: MarketState,
    ) -> Option<BackfillCommand> {
        if status.state == HistoryState::Ok {
            return None;
        }

        if market_state == MarketState::Closed && status.state != HistoryState::Insufficient {
            debug!(key = %key, state = %status.state, "market closed — suppressing routine backfill");
            return None;
        }

        let command = if key.interval == self.base_interval {
            CommandKind::Warmup
        } else {
            CommandKind::Backfill
        };

        let diagnostics = if status.gaps_count > 0 {
            Some(GapDiagnostics {
                gaps_count: status.gaps_count,
                max_gap_ms: status.max_gap_ms,
            })
        } else {
            None
        };

        Some(BackfillCommand {
            id: Uuid::new_v4().to_string(),
            symbol: key.symbol.clone(),
            interval: key.interval.clone(),
            command,
            reason: status.state.as_reason().to_string(),
            diagnostics,
        })
    }

    /// Publish `cmd` on the outbound channel. A full channel is logged and
    /// dropped; the next evaluation cycle re-emits.
    pub fn publish(&self, cmd: BackfillCommand) {
        let key = format!("{}@{}", cmd.symbol, cmd.interval);
        match self.command_tx.try_send(cmd) {
            Ok(()) => info!(key = %key, "backfill command published"),
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(key = %key, command = %cmd.command, "command channel full — request dropped, will retry next cycle");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(key = %key, "command channel closed — feed adapter gone?");
            }
        }
    }

    /// Evaluate and, if warranted, publish. Returns the published command.
    pub fn evaluate_and_publish(
        &self,
        key: &SeriesKey,
        status: &HistoryStatus,
        market_state: MarketState,
    ) -> Option<BackfillCommand> {
        let cmd = self.evaluate(key, status, market_state)?;
        self.publish(cmd.clone());
        Some(cmd)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: HistoryState, gaps: u32, max_gap: i64) -> HistoryStatus {
        HistoryStatus {
            state,
            gaps_count: gaps,
            max_gap_ms: max_gap,
            non_monotonic_count: 0,
            last_open_time: Some(0),
            age_seconds: Some(60),
            needs_backfill: state != HistoryState::Ok,
        }
    }

    fn coordinator() -> (BackfillCoordinator, mpsc::Receiver<BackfillCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (BackfillCoordinator::new("1m", tx), rx)
    }

    #[test]
    fn ok_state_emits_nothing() {
        let (coord, _rx) = coordinator();
        let key = SeriesKey::new("BTCUSDT", "1m");
        assert!(coord
            .evaluate(&key, &status(HistoryState::Ok, 0, 0), MarketState::Open)
            .is_none());
    }

    #[test]
    fn closed_market_suppresses_routine_requests() {
        let (coord, _rx) = coordinator();
        let key = SeriesKey::new("BTCUSDT", "5m");
        assert!(coord
            .evaluate(
                &key,
                &status(HistoryState::GappyTail, 2, 180_000),
                MarketState::Closed
            )
            .is_none());
        assert!(coord
            .evaluate(
                &key,
                &status(HistoryState::StaleTail, 0, 0),
                MarketState::Closed
            )
            .is_none());
    }

    #[test]
    fn insufficient_requested_even_on_closed_market() {
        let (coord, _rx) = coordinator();
        let key = SeriesKey::new("BTCUSDT", "1m");
        let cmd = coord
            .evaluate(
                &key,
                &status(HistoryState::Insufficient, 0, 0),
                MarketState::Closed,
            )
            .unwrap();
        assert_eq!(cmd.command, CommandKind::Warmup);
        assert_eq!(cmd.reason, "insufficient");
    }

    #[test]
    fn base_interval_gets_warmup_others_backfill() {
        let (coord, _rx) = coordinator();
        let base = SeriesKey::new("BTCUSDT", "1m");
        let derived = SeriesKey::new("BTCUSDT", "15m");
        let s = status(HistoryState::GappyTail, 1, 120_000);

        let warm = coord.evaluate(&base, &s, MarketState::Open).unwrap();
        assert_eq!(warm.command, CommandKind::Warmup);

        let back = coord.evaluate(&derived, &s, MarketState::Open).unwrap();
        assert_eq!(back.command, CommandKind::Backfill);
        assert_eq!(back.reason, "gappy_tail");
    }

    #[test]
    fn gap_diagnostics_attached_when_relevant() {
        let (coord, _rx) = coordinator();
        let key = SeriesKey::new("BTCUSDT", "5m");
        let cmd = coord
            .evaluate(
                &key,
                &status(HistoryState::GappyTail, 3, 900_000),
                MarketState::Open,
            )
            .unwrap();
        let diag = cmd.diagnostics.unwrap();
        assert_eq!(diag.gaps_count, 3);
        assert_eq!(diag.max_gap_ms, 900_000);

        // Stale with no gaps -> no diagnostics block.
        let cmd = coord
            .evaluate(&key, &status(HistoryState::StaleTail, 0, 0), MarketState::Open)
            .unwrap();
        assert!(cmd.diagnostics.is_none());
    }

    #[tokio::test]
    async fn evaluate_and_publish_lands_on_channel() {
        let (coord, mut rx) = coordinator();
        let key = SeriesKey::new("ETHUSDT", "1h");
        coord.evaluate_and_publish(
            &key,
            &status(HistoryState::StaleTail, 0, 0),
            MarketState::Open,
        );
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.symbol, "ETHUSDT");
        assert_eq!(cmd.interval, "1h");
        assert_eq!(cmd.command, CommandKind::Backfill);
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let coord = BackfillCoordinator::new("1m", tx);
        let key = SeriesKey::new("BTCUSDT", "1m");
        let s = status(HistoryState::StaleTail, 0, 0);
        // Second publish hits a full channel; must not panic or block.
        coord.evaluate_and_publish(&key, &s, MarketState::Open);
        coord.evaluate_and_publish(&key, &s, MarketState::Open);
    }
}
