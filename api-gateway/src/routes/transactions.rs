use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};

use bidchain::{RuntimeError, Transaction};

use crate::state::SharedState;

/// Request body for `POST /transactions`.
#[derive(Debug, Deserialize)]
pub struct SubmitTransactionRequest {
    /// Opaque application payload, signed by the node wallet.
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitTransactionResponse {
    pub status: &'static str,
    pub transaction: Transaction,
}

/// `POST /transactions`
///
/// Signs the payload with the node wallet, pools it and broadcasts it to
/// peers. The transaction is included in the block of the first round
/// whose collection window it falls into.
pub async fn submit_transaction(
    State(state): State<SharedState>,
    Json(body): Json<SubmitTransactionRequest>,
) -> Result<(StatusCode, Json<SubmitTransactionResponse>), (StatusCode, String)> {
    if body.payload.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "payload must not be empty".to_string()));
    }
    let tx = state
        .client
        .submit_transaction(body.payload)
        .await
        .map_err(|e| match e {
            RuntimeError::Stopped => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            other => (StatusCode::UNPROCESSABLE_ENTITY, other.to_string()),
        })?;
    tracing::info!(id = %tx.id, "transaction accepted via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitTransactionResponse {
            status: "pooled",
            transaction: tx,
        }),
    ))
}

/// `GET /transactions`
///
/// Transactions currently waiting in the pool.
pub async fn list_transactions(State(state): State<SharedState>) -> Json<Vec<Transaction>> {
    Json(state.client.node().lock().await.pool().transactions())
}
