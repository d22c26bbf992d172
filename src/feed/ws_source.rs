// =============================================================================
// Feed WebSocket source — live bar-batch subscription
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::FeedIngest;

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Hold one WebSocket connection to the feed and push every text frame
/// through the ingestion pipeline.
///
/// Runs until the stream disconnects or an error occurs, then returns so the
/// caller can handle reconnection.
pub async fn run_feed_stream(url: &str, ingest: &Arc<FeedIngest>) -> Result<()> {
    info!(url = %url, "connecting to feed WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to feed WebSocket")?;

    info!(url = %url, "feed WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    // A rejected frame is logged and skipped; the stream
                    // stays up.
                    if let Err(e) = ingest.apply(&text) {
                        warn!(error = %e, "feed frame rejected");
                    }
                }
                // Ping / Pong / Binary / Close frames are ignored --
                // tungstenite answers pings automatically.
            }
            Some(Err(e)) => {
                error!(error = %e, "feed WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("feed WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Supervision loop: reconnect with a fixed delay until shutdown.
pub async fn run_feed_loop(url: String, ingest: Arc<FeedIngest>, mut shutdown: watch::Receiver<bool>) {
    if url.is_empty() {
        warn!("no feed URL configured — live ingestion disabled");
        return;
    }

    loop {
        tokio::select! {
            result = run_feed_stream(&url, &ingest) => {
                if let Err(e) = result {
                    error!(error = %e, "feed stream error");
                }
            }
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            info!("feed loop shutting down");
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("feed loop shutting down");
                    return;
                }
            }
        }
    }
}
