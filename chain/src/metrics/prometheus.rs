//! Prometheus-backed metrics and HTTP exporter.
//!
//! This module defines a [`MetricsRegistry`] that owns a Prometheus
//! registry and a set of strongly-typed consensus metrics, and an
//! async HTTP exporter that serves `/metrics` using `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, header::HeaderValue,
    server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Consensus-related Prometheus metrics.
///
/// These are registered into a [`Registry`] and updated by the consensus
/// node as it handles phases and messages. Cloning is cheap; every field
/// is a handle to the same underlying metric.
#[derive(Clone)]
pub struct ConsensusMetrics {
    pub rounds_started: IntCounter,
    /// Inbound messages by wire `type`.
    pub messages_received: IntCounterVec,
    pub bids_accepted: IntCounter,
    pub bids_rejected: IntCounter,
    pub blocks_accepted: IntCounter,
    pub blocks_rejected: IntCounter,
    /// Rounds skipped because fewer than the minimum number of bids arrived.
    pub rounds_skipped: IntCounter,
    pub votes_recorded: IntCounter,
    pub majority_decisions: IntCounter,
    pub malicious_strikes: IntCounter,
    pub blacklisted_peers: IntGauge,
    /// Transaction-pool repairs that converged on the majority root.
    pub pool_repairs: IntCounter,
    pub chain_height: IntGauge,
    /// Time from round start until the round's block was appended.
    pub block_latency_seconds: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl ConsensusMetrics {
    /// Registers consensus metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_received = IntCounterVec::new(
            Opts::new("consensus_messages_received", "Inbound peer messages by type"),
            &["type"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let block_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "consensus_block_latency_seconds",
                "Time from round start until the round's block was appended, in seconds",
            )
            .buckets(vec![
                1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 540.0, 600.0, 900.0,
            ]),
        )?;
        registry.register(Box::new(block_latency_seconds.clone()))?;

        Ok(Self {
            rounds_started: counter(registry, "consensus_rounds_started", "Rounds entered by this node")?,
            messages_received,
            bids_accepted: counter(registry, "consensus_bids_accepted", "Peer bids accepted")?,
            bids_rejected: counter(registry, "consensus_bids_rejected", "Peer bids rejected")?,
            blocks_accepted: counter(registry, "consensus_blocks_accepted", "Blocks appended to the local chain")?,
            blocks_rejected: counter(registry, "consensus_blocks_rejected", "Blocks rejected by admission checks")?,
            rounds_skipped: counter(
                registry,
                "consensus_rounds_skipped",
                "Rounds without a proposal due to insufficient bids",
            )?,
            votes_recorded: counter(registry, "consensus_votes_recorded", "Block and chain votes counted")?,
            majority_decisions: counter(registry, "consensus_majority_decisions", "Two-thirds majority decisions reached")?,
            malicious_strikes: counter(registry, "consensus_malicious_strikes", "Strikes recorded against peers")?,
            blacklisted_peers: gauge(registry, "consensus_blacklisted_peers", "Currently blacklisted identities")?,
            pool_repairs: counter(registry, "consensus_pool_repairs", "Transaction pool repairs that converged")?,
            chain_height: gauge(registry, "consensus_chain_height", "Index of the local chain tip")?,
            block_latency_seconds,
        })
    }
}

/// Wrapper around a Prometheus registry and the consensus metrics.
///
/// This is the main handle you pass around in the node. It can be wrapped
/// in an [`Arc`] and shared across threads/tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub consensus: ConsensusMetrics,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// and registers the consensus metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("bidchain".to_string()), None)?;
        let consensus = ConsensusMetrics::register(&registry)?;
        Ok(Self {
            registry,
            consensus,
        })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server that exposes Prometheus metrics.
///
/// The server listens on `addr` and serves `GET /metrics` with the
/// Prometheus text exposition format. All other paths return 404.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics exporter listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                warn!(error = %err, "metrics HTTP connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Full::new(Bytes::from(metrics.gather_text())));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Full::new(Bytes::from("not found")));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn consensus_metrics_register_and_record() {
        let registry = Registry::new();
        let metrics = ConsensusMetrics::register(&registry).expect("register metrics");

        metrics.rounds_started.inc();
        metrics.messages_received.with_label_values(&["BID"]).inc();
        metrics.blacklisted_peers.set(2);
        metrics.block_latency_seconds.observe(42.0);

        let metric_families = registry.gather();
        assert!(!metric_families.is_empty());
    }

    #[test]
    fn metrics_registry_gather_text_works() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        registry.consensus.malicious_strikes.inc();
        let text = registry.gather_text();
        assert!(text.contains("bidchain_consensus_malicious_strikes"));
    }
}
