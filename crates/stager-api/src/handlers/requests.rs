//! /submit, /requests, cancel, and shaping handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use stager_core::request::{Dataset, FailurePolicy, Priority, TransferMode};
use stager_core::Error;
use stager_services::{CancelOutcome, RequestStatus};

use super::ApiState;

// ── /submit ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub sources: Vec<Dataset>,
    pub targets: Vec<Dataset>,
    #[serde(default)]
    pub mode: TransferMode,
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub id: u64,
    pub tasks: usize,
}

pub async fn handle_submit(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let request = state
        .engine
        .submit(req.sources, req.targets, req.mode, req.policy, req.priority)
        .map_err(|err| match err {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;

    let tasks = state
        .tracker
        .status(request.id)
        .map(|s| s.tasks_total)
        .unwrap_or(0);

    Ok(Json(SubmitResponse {
        id: request.id,
        tasks,
    }))
}

// ── /requests ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RequestsResponse {
    pub requests: Vec<RequestStatus>,
}

pub async fn handle_requests(State(state): State<ApiState>) -> Json<RequestsResponse> {
    let mut requests = state.tracker.list();
    requests.sort_by_key(|r| r.id);
    Json(RequestsResponse { requests })
}

// ── /requests/{id} ────────────────────────────────────────────────────────────

pub async fn handle_request(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<RequestStatus>, (StatusCode, String)> {
    state
        .tracker
        .status(id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("no request {id}")))
}

// ── /requests/{id}/cancel ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CancelResponse {
    pub id: u64,
    pub outcome: String,
}

pub async fn handle_cancel(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let outcome = match state.tracker.cancel(id) {
        CancelOutcome::Cancelled => "cancelling",
        CancelOutcome::AlreadyCancelling => "already_cancelling",
        CancelOutcome::AlreadyFinished => "already_finished",
        CancelOutcome::NotFound => {
            return Err((StatusCode::NOT_FOUND, format!("no request {id}")));
        }
    };
    tracing::info!(request_id = id, outcome, "cancel requested via API");
    Ok(Json(CancelResponse {
        id,
        outcome: outcome.to_string(),
    }))
}

// ── /requests/{id}/shaping ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ShapingRequest {
    /// 0 removes the limit.
    pub bytes_per_sec: u64,
}

#[derive(Serialize)]
pub struct ShapingResponse {
    pub id: u64,
    pub bytes_per_sec: u64,
}

pub async fn handle_shaping(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    Json(req): Json<ShapingRequest>,
) -> Result<Json<ShapingResponse>, (StatusCode, String)> {
    if state.tracker.request(id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("no request {id}")));
    }
    state.shaping.set_limit(id, req.bytes_per_sec);
    tracing::info!(
        request_id = id,
        bytes_per_sec = req.bytes_per_sec,
        "bandwidth limit updated via API"
    );
    Ok(Json(ShapingResponse {
        id,
        bytes_per_sec: req.bytes_per_sec,
    }))
}
