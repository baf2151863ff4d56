// api-gateway/src/main.rs

//! API gateway binary.
//!
//! This binary exposes a small HTTP API on top of the `bidchain` crate:
//!
//! - `GET /health`
//! - `GET /public-key`
//! - `POST /transactions`, `GET /transactions`
//! - `GET /chain`
//! - `GET /bids/{round}`
//! - `GET /malicious`
//!
//! It embeds a full node (RocksDB ledger, TCP peer transport, round
//! scheduler) and a Prometheus metrics exporter on `/metrics`.

mod config;
mod routes;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::signal;

use bidchain::{ChainConfig, MetricsRegistry, run_prometheus_http_server, start_default_node};
use config::ApiConfig;
use routes::{health, ledger, transactions};
use state::{AppState, SharedState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bidchain=info,api_gateway=info".to_string()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let api_cfg = ApiConfig::from_env()?;
    let chain_cfg = ChainConfig::from_env().map_err(|e| e.to_string())?;

    // ---------------------------
    // Metrics
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if chain_cfg.metrics.enabled {
        let exporter = metrics.clone();
        let addr = chain_cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(exporter, addr).await {
                tracing::warn!(error = %e, "metrics HTTP server error");
            }
        });
    }

    // ---------------------------
    // Embedded node
    // ---------------------------

    let runtime = start_default_node(&chain_cfg, Some(metrics.consensus.clone()))
        .await
        .map_err(|e| format!("failed to start node (db {}): {e}", chain_cfg.storage.path))?;

    let app_state: SharedState = Arc::new(AppState {
        client: runtime.client(),
        metrics: metrics.clone(),
    });

    let node_task = tokio::spawn(runtime.run(shutdown_signal()));

    // ---------------------------
    // HTTP router
    // ---------------------------

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/public-key", get(ledger::public_key))
        .route(
            "/transactions",
            post(transactions::submit_transaction).get(transactions::list_transactions),
        )
        .route("/chain", get(ledger::chain))
        .route("/bids/{round}", get(ledger::bids))
        .route("/malicious", get(ledger::malicious))
        .with_state(app_state);

    tracing::info!("API gateway listening on http://{}", api_cfg.listen_addr);

    let listener = tokio::net::TcpListener::bind(api_cfg.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", api_cfg.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("API server error: {e}"))?;

    if let Err(e) = node_task.await {
        tracing::error!(error = %e, "node runtime task failed");
    }
    Ok(())
}

/// Waits for Ctrl-C and returns, used for graceful shutdown.
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
