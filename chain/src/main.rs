// src/main.rs
//
// Headless node:
//
// - RocksDB-backed ledger and persisted wallet key
// - Base + integrity block validity, longest-chain fork choice
// - TCP peer transport with the configured static peers
// - Prometheus metrics exporter on /metrics
// - Round scheduler driven node loop until Ctrl-C.

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};

use bidchain::{ChainConfig, MetricsRegistry, run_prometheus_http_server, start_default_node};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bidchain=info,api_gateway=info".to_string()),
        )
        .init();

    if let Err(err) = run_node().await {
        tracing::error!("fatal error: {err}");
        std::process::exit(1);
    }
}

async fn run_node() -> Result<(), String> {
    let cfg = ChainConfig::from_env().map_err(|e| e.to_string())?;

    let metrics = Arc::new(
        MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if cfg.metrics.enabled {
        let exporter = metrics.clone();
        let addr = cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(exporter, addr).await {
                warn!(error = %e, "metrics HTTP server error");
            }
        });
    }

    let runtime = start_default_node(&cfg, Some(metrics.consensus.clone()))
        .await
        .map_err(|e| format!("failed to start node (db {}): {e}", cfg.storage.path))?;

    info!(
        mode = ?cfg.consensus.mode,
        round_interval_ms = cfg.consensus.round_interval_ms,
        "node running"
    );
    runtime.run(shutdown_signal()).await;
    Ok(())
}

/// Waits for Ctrl-C and returns, used for graceful shutdown.
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
