//! /nodes handlers — malleability events arrive here.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use stager_services::MalleabilityEvent;

use super::ApiState;

// ── /nodes ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
    pub queued_tasks: usize,
}

#[derive(Serialize)]
pub struct NodeInfo {
    pub node: String,
    pub workers: u32,
}

pub async fn handle_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    let nodes = state
        .scheduler
        .nodes()
        .into_iter()
        .map(|(node, workers)| NodeInfo { node, workers })
        .collect();
    Json(NodesResponse {
        nodes,
        queued_tasks: state.scheduler.queued_tasks(),
    })
}

// ── /nodes/add, /nodes/remove ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct NodesChangeRequest {
    pub nodes: Vec<String>,
}

#[derive(Serialize)]
pub struct NodesChangeResponse {
    pub changed: usize,
}

pub async fn handle_nodes_add(
    State(state): State<ApiState>,
    Json(req): Json<NodesChangeRequest>,
) -> Result<Json<NodesChangeResponse>, (StatusCode, String)> {
    if req.nodes.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no nodes named".to_string()));
    }
    let changed = state
        .scheduler
        .apply(MalleabilityEvent::NodeAdded { nodes: req.nodes });
    Ok(Json(NodesChangeResponse { changed }))
}

pub async fn handle_nodes_remove(
    State(state): State<ApiState>,
    Json(req): Json<NodesChangeRequest>,
) -> Result<Json<NodesChangeResponse>, (StatusCode, String)> {
    if req.nodes.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no nodes named".to_string()));
    }
    let changed = state
        .scheduler
        .apply(MalleabilityEvent::NodeRemoved { nodes: req.nodes });
    Ok(Json(NodesChangeResponse { changed }))
}
