//! Shared application state.

use std::sync::Arc;

use bidchain::{DefaultBlockValidator, DefaultForkChoice, DefaultLedgerStore, MetricsRegistry, NodeClient};

pub type GatewayClient = NodeClient<DefaultLedgerStore, DefaultBlockValidator, DefaultForkChoice>;

/// Shared state held by the API handlers.
///
/// This is wrapped in an [`Arc`] and passed to request handlers via Axum's
/// `State` extractor.
pub struct AppState {
    /// Handle to the embedded node's event loop.
    pub client: GatewayClient,
    /// Metrics registry shared between consensus and the API.
    pub metrics: Arc<MetricsRegistry>,
}

/// Thread-safe alias for `AppState`.
pub type SharedState = Arc<AppState>;
