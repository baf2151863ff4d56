//! Prometheus instrumentation.
//!
//! [`ConsensusMetrics`] holds the round, bid, block, vote, blacklist and
//! pool-repair series a [`crate::ConsensusNode`] updates once attached with
//! `with_metrics`. [`run_prometheus_http_server`] serves the registry as
//! text on `GET /metrics`; both binaries spawn it unless `METRICS_ADDR=off`.

pub mod prometheus;

pub use prometheus::{ConsensusMetrics, MetricsRegistry, run_prometheus_http_server};
