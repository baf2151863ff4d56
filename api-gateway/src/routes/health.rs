use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::SharedState;

/// Liveness plus a glance at the node.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub height: u64,
    pub round: u64,
    pub peers: usize,
    pub blocks_accepted: u64,
}

/// `GET /health`
pub async fn health(State(state): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let node = state.client.node().lock().await;
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            height: node.tip().index,
            round: node.current_round(),
            peers: node.peers().len(),
            blocks_accepted: state.metrics.consensus.blocks_accepted.get(),
        }),
    )
}
