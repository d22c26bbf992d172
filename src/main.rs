// =============================================================================
// Meridian Market-Data Cache — Main Entry Point
// =============================================================================
//
// Startup order matters: the store and flusher come up first, then the cold
// start orchestrator gates the status API's `authoritative` flag while the
// feed boundary fills the tiers. Shutdown drains the flush queue within a
// bounded timeout before the process exits.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backfill;
mod coldstart;
mod config;
mod feed;
mod health;
mod materialize;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::backfill::BackfillCoordinator;
use crate::coldstart::{ColdStartOrchestrator, ColdStartStatus, InvariantReplay};
use crate::config::RuntimeConfig;
use crate::feed::{history, ws_source, FeedIngest, HistoryClient};
use crate::health::{HealthParams, HistoryHealthAnalyzer};
use crate::materialize::TimeframeMaterializer;
use crate::store::{DiskTier, InProcessFastCache, TieredStore, WriteBehindFlusher};
use crate::types::SeriesKey;

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Market-Data Cache — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(url) = std::env::var("MERIDIAN_FEED_URL") {
        config.feed_url = url;
    }

    let base_interval = config.base_interval().to_string();
    info!(
        symbols = ?config.symbols,
        intervals = ?config.intervals,
        base_interval = %base_interval,
        data_dir = %config.data_dir,
        "Configured series universe"
    );

    // ── 2. Build the tiered store ────────────────────────────────────────
    let fast = Arc::new(InProcessFastCache::new());
    let disk = Arc::new(DiskTier::new(&config.data_dir));
    let (store, flush_rx, flush_backlog) = TieredStore::new(
        fast,
        disk.clone(),
        config.store_profile.clone(),
        config.retention_limit,
        config.flush_queue_capacity,
    );
    let store = Arc::new(store);

    // ── 3. Shutdown signal shared by every background task ───────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Write-behind flusher ──────────────────────────────────────────
    let flusher = WriteBehindFlusher::new(
        store.clone(),
        disk.clone(),
        flush_rx,
        flush_backlog,
        config.flush_batch_min,
        config.flush_batch_max,
        Duration::from_millis(config.flush_interval_ms),
        Duration::from_secs(config.shutdown_drain_timeout_secs),
    );
    let flusher_handle = tokio::spawn(flusher.run(shutdown_rx.clone()));

    // ── 5. Analysis & coordination subsystems ────────────────────────────
    let analyzer = Arc::new(HistoryHealthAnalyzer::new(
        store.clone(),
        HealthParams {
            min_history_rows: config.min_history_rows,
            tail_window: config.tail_window,
            gap_factor: config.gap_factor,
            stale_after_bars: config.stale_after_bars,
        },
    ));
    let materializer = Arc::new(TimeframeMaterializer::new(
        store.clone(),
        base_interval.clone(),
        config.gap_factor,
    ));

    let (command_tx, command_rx) = mpsc::channel(64);
    let coordinator = Arc::new(BackfillCoordinator::new(base_interval.clone(), command_tx));

    let cold_start = Arc::new(ColdStartStatus::new());
    let session = config.session.clone();
    let warmup_rows = config.warmup_rows;

    // ── 6. Shared application state & API server ─────────────────────────
    let runtime_config = Arc::new(RwLock::new(config));
    let state = Arc::new(AppState::new(
        runtime_config.clone(),
        store.clone(),
        materializer.clone(),
        analyzer.clone(),
        cold_start.clone(),
    ));

    let api_state = state.clone();
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 7. Feed boundary ─────────────────────────────────────────────────
    let feed_secret = std::env::var("MERIDIAN_FEED_SECRET").ok().filter(|s| !s.is_empty());
    let ingest = Arc::new(FeedIngest::new(
        store.clone(),
        analyzer.clone(),
        coordinator.clone(),
        session.clone(),
        feed_secret,
    ));
    let feed_url = runtime_config.read().feed_url.clone();
    tokio::spawn(ws_source::run_feed_loop(
        feed_url,
        ingest,
        shutdown_rx.clone(),
    ));

    let history_base = runtime_config.read().history_base_url.clone();
    let history_client = HistoryClient::new(history_base);
    tokio::spawn(history::run_command_consumer(
        history_client,
        store.clone(),
        command_rx,
        warmup_rows,
        shutdown_rx.clone(),
    ));

    // ── 8. Cold start orchestrator ───────────────────────────────────────
    let orchestrator = {
        let cfg = runtime_config.read();
        ColdStartOrchestrator::new(
            &cfg,
            store.clone(),
            analyzer.clone(),
            coordinator.clone(),
            materializer.clone(),
            Arc::new(InvariantReplay),
            cold_start.clone(),
        )
    };
    let orch_state = state.clone();
    let orch_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let final_state = orchestrator.run(orch_shutdown).await;
        info!(state = %final_state, "cold start finished");
        orch_state.increment_version();
    });

    // ── 9. TTL sweep loop ────────────────────────────────────────────────
    let sweep_store = store.clone();
    let sweep_state = state.clone();
    let sweep_secs = runtime_config.read().sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs.max(1)));
        loop {
            interval.tick().await;
            let evicted = sweep_store.sweep();
            if !evicted.is_empty() {
                info!(count = evicted.len(), "TTL sweep evicted series from memory");
                sweep_state.increment_version();
            }
        }
    });

    // ── 10. Periodic health & backfill loop ──────────────────────────────
    let health_state = state.clone();
    let health_coordinator = coordinator.clone();
    let health_session = session.clone();
    let health_secs = runtime_config.read().health_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(health_secs.max(1)));
        loop {
            interval.tick().await;

            let (symbols, intervals) = {
                let cfg = health_state.runtime_config.read();
                (cfg.symbols.clone(), cfg.intervals.clone())
            };
            let market_state = health_session.market_state_now();
            let now_ms = chrono::Utc::now().timestamp_millis();

            for symbol in &symbols {
                for iv in &intervals {
                    let key = SeriesKey::new(symbol.clone(), iv.clone());
                    let status = health_state.analyzer.compute_history_status(&key, now_ms);
                    health_coordinator.evaluate_and_publish(&key, &status, market_state);
                    health_state.record_health(key, status);
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    // Wait for the flusher's bounded final drain before exiting.
    match flusher_handle.await {
        Ok(0) => info!("flush queue drained cleanly"),
        Ok(pending) => error!(pending, "flush queue not fully drained — possible data loss"),
        Err(e) => error!(error = %e, "flusher task panicked"),
    }

    if let Err(e) = runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Meridian shut down complete.");
    Ok(())
}
