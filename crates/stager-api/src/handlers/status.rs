//! /ping, /status, and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

// ── /ping ─────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PingResponse {
    pub ok: bool,
    pub version: &'static str,
}

pub async fn handle_ping() -> Json<PingResponse> {
    Json(PingResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ── /status ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub transport: &'static str,
    pub uptime_secs: u64,
    pub nodes: usize,
    pub queued_tasks: usize,
    pub requests_total: usize,
    pub requests_active: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let statuses = state.tracker.list();
    let requests_active = statuses
        .iter()
        .filter(|s| !s.state.is_terminal())
        .count();

    Json(StatusResponse {
        transport: state.transport_name,
        uptime_secs: state.started_at.elapsed().as_secs(),
        nodes: state.scheduler.nodes().len(),
        queued_tasks: state.scheduler.queued_tasks(),
        requests_total: statuses.len(),
        requests_active,
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
