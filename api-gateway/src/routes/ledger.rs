//! Read-only views of the node's chain, bids and blacklist.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use bidchain::consensus::MaliciousSnapshot;
use bidchain::{BidPacket, Block};

use crate::state::SharedState;

#[derive(Serialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

/// `GET /public-key`
pub async fn public_key(State(state): State<SharedState>) -> Json<PublicKeyResponse> {
    let node = state.client.node().lock().await;
    Json(PublicKeyResponse {
        public_key: node.public_key().to_hex(),
    })
}

/// `GET /chain`
pub async fn chain(State(state): State<SharedState>) -> Json<Vec<Block>> {
    Json(state.client.node().lock().await.chain().to_vec())
}

/// `GET /bids/{round}`
pub async fn bids(State(state): State<SharedState>, Path(round): Path<u64>) -> Json<Vec<BidPacket>> {
    Json(state.client.node().lock().await.bids_for_round(round))
}

/// `GET /malicious`
pub async fn malicious(State(state): State<SharedState>) -> Json<MaliciousSnapshot> {
    Json(state.client.node().lock().await.malicious().snapshot())
}
