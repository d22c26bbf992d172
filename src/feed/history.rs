// =============================================================================
// History REST client — answers warmup/backfill commands from the upstream API
// =============================================================================
//
// The coordinator publishes pure requests; this module is the only place that
// actually fetches history. Responses use the exchange's array-of-arrays
// klines format:
//
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
//   [6] closeTime, ...
//
// Malformed rows are skipped with a warning; the rest of the response lands.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::message::parse_string_f64;
use crate::store::TieredStore;
use crate::types::{BackfillCommand, Bar, SeriesKey};

#[derive(Clone)]
pub struct HistoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// GET /api/v3/klines (public — no signature required).
    #[instrument(skip(self), name = "history::get_bars")]
    pub async fn get_bars(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Bar>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("history GET /api/v3/klines returned {}: {}", status, body);
        }

        let bars = parse_klines(&body)?;
        debug!(symbol, interval, count = bars.len(), "history fetched");
        Ok(bars)
    }
}

/// Parse an array-of-arrays klines response.
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Bar>> {
    let raw = body.as_array().context("klines response is not an array")?;
    let mut bars = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = match entry.as_array() {
            Some(a) if a.len() >= 7 => a,
            _ => {
                warn!("skipping malformed kline row");
                continue;
            }
        };

        let row = (|| -> Result<Bar> {
            Ok(Bar {
                open_time: arr[0].as_i64().context("openTime is not an integer")?,
                open: parse_string_f64(&arr[1], "open")?,
                high: parse_string_f64(&arr[2], "high")?,
                low: parse_string_f64(&arr[3], "low")?,
                close: parse_string_f64(&arr[4], "close")?,
                volume: parse_string_f64(&arr[5], "volume")?,
                close_time: arr[6].as_i64().context("closeTime is not an integer")?,
            })
        })();

        match row {
            Ok(bar) => bars.push(bar),
            Err(e) => warn!(error = %e, "skipping malformed kline row"),
        }
    }

    Ok(bars)
}

/// Consume the coordinator's command channel: each command becomes one
/// history fetch merged back into the store. Fetch failures are logged and
/// dropped; the next health cycle re-emits the request.
pub async fn run_command_consumer(
    client: HistoryClient,
    store: Arc<TieredStore>,
    mut commands: mpsc::Receiver<BackfillCommand>,
    fetch_rows: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let cmd = tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => {
                    info!("command channel closed — consumer exiting");
                    return;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("command consumer shutting down");
                    return;
                }
                continue;
            }
        };

        let key = SeriesKey::new(cmd.symbol.clone(), cmd.interval.clone());
        info!(
            key = %key,
            command = %cmd.command,
            reason = %cmd.reason,
            id = %cmd.id,
            "answering history request"
        );

        match client.get_bars(&cmd.symbol, &cmd.interval, fetch_rows).await {
            Ok(bars) if bars.is_empty() => {
                warn!(key = %key, "history request returned no rows");
            }
            Ok(bars) => {
                let count = bars.len();
                store.put_bars(&key, bars);
                info!(key = %key, rows = count, "history merged");
            }
            Err(e) => {
                error!(key = %key, error = %e, "history fetch failed — will retry on next cycle");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_standard_klines_rows() {
        let body = json!([
            [0, "100.0", "101.0", "99.0", "100.5", "12.5", 59_999, "0", 10, "0", "0", "0"],
            [60_000, "100.5", "102.0", "100.0", "101.5", "8.0", 119_999, "0", 7, "0", "0", "0"]
        ]);
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 0);
        assert_eq!(bars[0].close_time, 59_999);
        assert!((bars[1].close - 101.5).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let body = json!([
            [0, "100.0", "101.0", "99.0", "100.5", "12.5", 59_999],
            ["garbage"],
            [60_000, "not-a-number", "1", "1", "1", "1", 119_999],
            [120_000, "1", "2", "0.5", "1.5", "3", 179_999]
        ]);
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].open_time, 120_000);
    }

    #[test]
    fn non_array_response_is_an_error() {
        assert!(parse_klines(&json!({"code": -1121, "msg": "Invalid symbol."})).is_err());
    }
}
