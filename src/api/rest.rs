// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::{interval_ms, valid_series_component, Priority, SeriesKey};

/// Default and maximum row counts for a bar read.
const DEFAULT_BARS_LIMIT: usize = 500;
const MAX_BARS_LIMIT: usize = 5_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/bars", get(bars))
        .route("/api/v1/reports", get(reports))
        .route("/api/v1/priority", post(set_priority))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    cold_start: String,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        cold_start: state.cold_start.state().to_string(),
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full status snapshot (authenticated)
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.build_snapshot();
    Json(snapshot)
}

// =============================================================================
// Bars (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct BarsQuery {
    symbol: String,
    interval: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn bars(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<BarsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    // Symbols flow into snapshot file names; reject path-capable input.
    if !valid_series_component(&query.symbol) {
        return Err(bad_request("symbol must be non-empty and alphanumeric"));
    }
    if interval_ms(&query.interval).is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("unrecognised interval: '{}'", query.interval),
            })),
        ));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_BARS_LIMIT)
        .clamp(1, MAX_BARS_LIMIT);

    let symbol = query.symbol.to_uppercase();
    Ok(Json(state.read_bars(&symbol, &query.interval, limit)))
}

// =============================================================================
// Cold-start reports (authenticated)
// =============================================================================

async fn reports(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reports = state
        .cold_start
        .reports()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<std::collections::HashMap<_, _>>();
    let qa_context = state
        .cold_start
        .qa_context()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<std::collections::HashMap<_, _>>();

    Json(serde_json::json!({
        "cold_start": state.cold_start.state(),
        "reports": reports,
        "qa_context": qa_context,
    }))
}

// =============================================================================
// Eviction priority (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct PriorityRequest {
    symbol: String,
    interval: String,
    priority: String,
}

async fn set_priority(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<PriorityRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !valid_series_component(&req.symbol) || !valid_series_component(&req.interval) {
        return Err(bad_request("symbol and interval must be alphanumeric"));
    }

    let priority = match req.priority.to_lowercase().as_str() {
        "cold" => Priority::Cold,
        "normal" => Priority::Normal,
        "alert" => Priority::Alert,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("invalid priority: '{other}'. Use 'cold', 'normal' or 'alert'."),
                })),
            ));
        }
    };

    let key = SeriesKey::new(req.symbol.to_uppercase(), req.interval.clone());
    state.store.set_priority(&key, priority);
    state.increment_version();
    info!(key = %key, priority = %priority, "eviction priority changed via API");

    Ok(Json(serde_json::json!({
        "key": key.to_string(),
        "priority": priority,
    })))
}

// =============================================================================
// Helpers
// =============================================================================

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}
