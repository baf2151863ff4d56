//! Chain library crate.
//!
//! This crate provides the core building blocks of a peer-to-peer chain
//! whose block proposer is elected by bids and whose decisions are taken
//! by two-thirds majority votes:
//!
//! - strongly-typed domain types (`types`) and signing (`crypto`),
//! - a modular consensus engine (`consensus`),
//! - the transaction pool and its synchronization (`mempool`),
//! - block validity predicates (`validation`),
//! - storage backends (`storage`),
//! - wire messages and the TCP transport (`p2p`),
//! - the async node loop (`runtime`),
//! - Prometheus-based metrics (`metrics`),
//! - and a top-level node configuration (`config`).
//!
//! Higher-level binaries can compose these pieces to build validator
//! nodes, simulators, and experiment harnesses.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod mempool;
pub mod metrics;
pub mod p2p;
pub mod runtime;
pub mod storage;
pub mod types;
pub mod validation;

// Re-export top-level configuration types.
pub use config::{ChainConfig, ConfigError, MetricsConfig, P2pConfig};

// Re-export "core" consensus types and traits.
pub use consensus::{
    BlockValidator, CombinedValidator, ConsensusConfig, ConsensusError, ConsensusMode,
    ConsensusNode, ForkChoice, Ledger, LedgerStore, LongestChainForkChoice, Outbound,
    RoundScheduler, ValidationError,
};

pub use crypto::{CryptoError, Wallet};
pub use mempool::{TransactionPool, TransactionSynchronizer};
pub use p2p::Message;
pub use runtime::{NodeClient, NodeRuntime, RuntimeError, start_default_node, unix_time_ms};

// Re-export storage backends.
pub use storage::{InMemoryLedgerStore, RocksDbConfig, RocksDbLedgerStore, StorageError};

pub use validation::{BaseValidity, IntegrityValidity};

// Re-export metrics registry and consensus metrics.
pub use metrics::{ConsensusMetrics, MetricsRegistry, run_prometheus_http_server};

// Re-export domain types at the crate root for convenience.
pub use types::*;

/// Type alias for the default block validator stack used by a "typical" node.
///
/// This composes:
///
/// - [`BaseValidity`] for cheap structural and size checks, and
/// - [`IntegrityValidity`] for hashes, signatures and parent linkage.
pub type DefaultBlockValidator = CombinedValidator<BaseValidity, IntegrityValidity>;

/// Type alias for the default fork-choice rule.
pub type DefaultForkChoice = LongestChainForkChoice;

/// Type alias for the default ledger store backend.
pub type DefaultLedgerStore = RocksDbLedgerStore;

/// Type alias for the default consensus node stack.
///
/// This uses:
///
/// - [`DefaultLedgerStore`] (RocksDB),
/// - [`DefaultBlockValidator`] (base + integrity),
/// - [`DefaultForkChoice`] (longest chain).
pub type DefaultConsensusNode = ConsensusNode<DefaultLedgerStore, DefaultBlockValidator, DefaultForkChoice>;
