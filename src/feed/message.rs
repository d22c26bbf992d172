// =============================================================================
// Feed wire format — bar-batch envelope parsing and HMAC verification
// =============================================================================
//
// Inbound frames carry one batch per (symbol, interval):
//
// ```json
// {
//   "symbol": "BTCUSDT",
//   "interval": "1m",
//   "bars": [ { "open_time": 0, "close_time": 59999, "open": "1.0", ... } ],
//   "signature": "hex-hmac"
// }
// ```
//
// Numeric fields may arrive as JSON numbers or strings. A malformed bar is
// dropped and counted without poisoning the rest of the batch; only envelope-
// level defects (bad JSON, missing identity, signature mismatch) reject the
// whole frame. The signature covers the bars exactly as received, so a bar
// that is later dropped as malformed never invalidates the frame it rode in.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::types::{valid_series_component, Bar, CacheError, SeriesKey};

type HmacSha256 = Hmac<Sha256>;

/// A parsed inbound batch. `dropped` counts bars discarded as malformed.
#[derive(Debug)]
pub struct BarBatch {
    pub key: SeriesKey,
    pub bars: Vec<Bar>,
    pub dropped: usize,
}

/// Parse a feed frame. When `secret` is configured every frame must carry a
/// valid signature over the canonical payload; unsigned or mis-signed frames
/// are rejected whole.
pub fn parse_batch(text: &str, secret: Option<&str>) -> Result<BarBatch, CacheError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| CacheError::DataIntegrity(format!("invalid batch JSON: {e}")))?;

    let symbol = root["symbol"]
        .as_str()
        .ok_or_else(|| CacheError::DataIntegrity("missing field symbol".into()))?
        .to_uppercase();
    let interval = root["interval"]
        .as_str()
        .ok_or_else(|| CacheError::DataIntegrity("missing field interval".into()))?
        .to_string();

    // Both become path components of the durable snapshot files.
    if !valid_series_component(&symbol) || !valid_series_component(&interval) {
        return Err(CacheError::DataIntegrity(format!(
            "symbol/interval must be alphanumeric, got '{symbol}'@'{interval}'"
        )));
    }

    let raw_bars = root["bars"]
        .as_array()
        .ok_or_else(|| CacheError::DataIntegrity("missing field bars".into()))?;

    // Verified over the bars as received — before the per-bar drop step, so
    // one malformed bar cannot turn into a whole-frame rejection.
    if let Some(secret) = secret {
        let signature = root["signature"].as_str().ok_or_else(|| {
            CacheError::DataIntegrity("unsigned batch on a signed feed".into())
        })?;
        verify_signature(secret, &symbol, &interval, &root["bars"], signature)?;
    }

    let mut bars = Vec::with_capacity(raw_bars.len());
    let mut dropped = 0usize;
    for entry in raw_bars {
        match parse_bar(entry) {
            Ok(bar) => bars.push(bar),
            Err(e) => {
                warn!(symbol = %symbol, interval = %interval, error = %e, "dropping malformed bar");
                dropped += 1;
            }
        }
    }

    Ok(BarBatch {
        key: SeriesKey::new(symbol, interval),
        bars,
        dropped,
    })
}

/// Hex HMAC-SHA256 over `SYMBOL|interval|<bars JSON>`. `bars JSON` is the
/// serde_json rendering of the bar array (compact, keys sorted), which is
/// exactly what the receiver reconstructs from the raw frame — signatures stay
/// valid even when individual bars inside the array fail to parse. Symbols
/// are signed uppercased.
pub fn sign_batch(secret: &str, symbol: &str, interval: &str, bars: &[Bar]) -> String {
    let value = serde_json::to_value(bars).expect("bars serialise to JSON");
    let mac = batch_mac(secret, symbol, interval, &value);
    hex::encode(mac.finalize().into_bytes())
}

fn batch_mac(secret: &str, symbol: &str, interval: &str, bars: &serde_json::Value) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{symbol}|{interval}|{bars}").as_bytes());
    mac
}

/// Constant-time verification via `Mac::verify_slice` over the raw bar array.
fn verify_signature(
    secret: &str,
    symbol: &str,
    interval: &str,
    bars: &serde_json::Value,
    signature: &str,
) -> Result<(), CacheError> {
    let presented = hex::decode(signature).map_err(|_| {
        CacheError::DataIntegrity(format!("malformed signature for {symbol}@{interval}"))
    })?;
    batch_mac(secret, symbol, interval, bars)
        .verify_slice(&presented)
        .map_err(|_| {
            CacheError::DataIntegrity(format!("signature mismatch for {symbol}@{interval}"))
        })
}

fn parse_bar(entry: &serde_json::Value) -> Result<Bar> {
    let open_time = entry["open_time"]
        .as_i64()
        .context("missing field open_time")?;
    let close_time = entry["close_time"]
        .as_i64()
        .context("missing field close_time")?;
    if close_time <= open_time {
        anyhow::bail!("close_time {close_time} not after open_time {open_time}");
    }

    Ok(Bar {
        open_time,
        close_time,
        open: parse_string_f64(&entry["open"], "open")?,
        high: parse_string_f64(&entry["high"], "high")?,
        low: parse_string_f64(&entry["low"], "low")?,
        close: parse_string_f64(&entry["close"], "close")?,
        volume: parse_string_f64(&entry["volume"], "volume")?,
    })
}

pub(crate) fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
