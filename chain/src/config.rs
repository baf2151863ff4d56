//! Top-level configuration for a chain node.
//!
//! This module aggregates configuration for:
//!
//! - consensus parameters (`ConsensusConfig`),
//! - storage (RocksDB path and creation flags),
//! - the peer-to-peer transport (listen address, static peers),
//! - metrics exporter (enable flag + listen address).
//!
//! Binaries start from [`ChainConfig::default`] and overlay environment
//! variables with [`ChainConfig::from_env`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

use crate::consensus::{ConsensusConfig, ConsensusMode};
use crate::storage::RocksDbConfig;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value {value:?} for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Configuration for the peer-to-peer transport.
#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub listen_addr: SocketAddr,
    /// Static peers (`host:port`) dialled at startup.
    pub peers: Vec<String>,
    /// Larger frames close the connection.
    pub max_message_bytes: usize,
    /// Per-connection outbound queue length.
    pub queue_len: usize,
    /// Pause between failed dial attempts.
    pub reconnect_ms: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 6001),
            peers: Vec::new(),
            max_message_bytes: 16 * 1024 * 1024,
            queue_len: 1024,
            reconnect_ms: 2_000,
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9898),
        }
    }
}

/// Top-level configuration for a chain node.
#[derive(Clone, Debug, Default)]
pub struct ChainConfig {
    pub consensus: ConsensusConfig,
    pub storage: RocksDbConfig,
    pub p2p: P2pConfig,
    pub metrics: MetricsConfig,
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

impl ChainConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns.
    ///
    /// Recognised keys: `P2P_HOST`, `P2P_PORT`, `PEERS` (comma separated),
    /// `DB_PATH`, `ROUND_INTERVAL_MS`, `MIN_BIDS_REQUIRED`,
    /// `CONSENSUS_MODE` (`bid` or `luck`), `STRICT_ROUNDS`, `METRICS_ADDR`
    /// (`off` disables the exporter).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(host) = lookup("P2P_HOST") {
            cfg.p2p.listen_addr.set_ip(parse("P2P_HOST", &host)?);
        }
        if let Some(port) = lookup("P2P_PORT") {
            cfg.p2p.listen_addr.set_port(parse("P2P_PORT", &port)?);
        }
        if let Some(peers) = lookup("PEERS") {
            cfg.p2p.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(path) = lookup("DB_PATH") {
            cfg.storage.path = path;
        }
        if let Some(v) = lookup("ROUND_INTERVAL_MS") {
            cfg.consensus = scale_round(cfg.consensus, parse("ROUND_INTERVAL_MS", &v)?)
                .map_err(|reason| ConfigError {
                    var: "ROUND_INTERVAL_MS",
                    value: v.clone(),
                    reason,
                })?;
        }
        if let Some(v) = lookup("MIN_BIDS_REQUIRED") {
            cfg.consensus.min_bids_required = parse("MIN_BIDS_REQUIRED", &v)?;
        }
        if let Some(v) = lookup("CONSENSUS_MODE") {
            cfg.consensus.mode = parse::<ConsensusMode>("CONSENSUS_MODE", &v)?;
        }
        if let Some(v) = lookup("STRICT_ROUNDS") {
            cfg.consensus.strict_rounds = parse("STRICT_ROUNDS", &v)?;
        }
        if let Some(v) = lookup("METRICS_ADDR") {
            if v.trim().eq_ignore_ascii_case("off") {
                cfg.metrics.enabled = false;
            } else {
                cfg.metrics.listen_addr = parse("METRICS_ADDR", &v)?;
            }
        }
        Ok(cfg)
    }
}

/// Rescales the phase offsets proportionally to a new round interval.
fn scale_round(mut c: ConsensusConfig, interval: u64) -> Result<ConsensusConfig, String> {
    if interval == 0 {
        return Err("round interval must be positive".into());
    }
    let old = c.round_interval_ms.max(1);
    let scale = |v: u64| (u128::from(v) * u128::from(interval) / u128::from(old)) as u64;
    c.phase1_duration_ms = scale(c.phase1_duration_ms);
    c.tx_collection_ms = scale(c.tx_collection_ms);
    c.phase3_start_ms = scale(c.phase3_start_ms);
    c.target_wait_ms = scale(c.target_wait_ms);
    c.round_interval_ms = interval;
    Ok(c)
}
