// =============================================================================
// Health endpoint — Axum 0.7, single public route
// =============================================================================
//
// The engine has no authenticated control surface (no feature flags, no
// pause/resume/kill endpoints, no websocket) — only a process liveness and
// last-scan-outcome probe for the operator's monitoring. Mirrors the shape of
// this corpus's REST health route without the CORS layer or bearer auth that
// guarded its other endpoints, since there are no other endpoints here.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tracing::info;

use crate::engine::Engine;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: i64,
    recent_error_count: usize,
    last_scan: Option<LastScanView>,
}

#[derive(Serialize)]
struct LastScanView {
    finished_at: chrono::DateTime<chrono::Utc>,
    duration_ms: u64,
    symbols_scanned: usize,
    succeeded: bool,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(engine)
}

async fn healthz(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let uptime_seconds = (chrono::Utc::now() - engine.started_at).num_seconds();
    let last_scan = engine.last_scan_outcome().map(|o| LastScanView {
        finished_at: o.finished_at,
        duration_ms: o.duration_ms,
        symbols_scanned: o.symbols_scanned,
        succeeded: o.succeeded,
    });

    Json(HealthResponse {
        status: "ok",
        uptime_seconds,
        recent_error_count: engine.recent_error_count(),
        last_scan,
    })
}

/// Bind and serve the health router until the process exits. Logged once on
/// bind so the operator can confirm the address before anything else starts.
pub async fn serve(engine: Arc<Engine>, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(bind_addr, "health endpoint listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}
