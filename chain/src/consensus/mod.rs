//! Consensus engine and related abstractions.
//!
//! This module provides a modular, testable consensus layer consisting of:
//!
//! - configuration parameters ([`config::ConsensusConfig`]),
//! - per-round bid collection ([`bids::BidManager`]) and proposer
//!   election by closest bid ([`selector`]),
//! - candidate block derivation ([`proposer::Proposer`]),
//! - the validated chain and its persistence ([`ledger::Ledger`],
//!   [`store::LedgerStore`]),
//! - two-thirds majority voting and blacklisting
//!   ([`coordinator::ConsensusCoordinator`], [`votes`], [`malicious`]),
//! - the pure round phase machine ([`scheduler::RoundScheduler`]),
//! - the luck-mode alternative to bids ([`luck`]),
//! - and the node that ties them together ([`engine::ConsensusNode`]).

pub mod bids;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fork_choice;
pub mod ledger;
pub mod luck;
pub mod malicious;
pub mod proposer;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod validator;
pub mod votes;

pub use bids::BidManager;
pub use config::{ConsensusConfig, ConsensusMode};
pub use coordinator::{ChainKey, ConsensusCoordinator};
pub use engine::{ConsensusNode, Deferred, Outbound, load_or_create_wallet};
pub use error::{ConsensusError, ValidationError};
pub use fork_choice::{ForkChoice, LongestChainForkChoice};
pub use ledger::Ledger;
pub use malicious::{MaliciousRecord, MaliciousSnapshot};
pub use proposer::{Proposer, RoundTarget, TxPool};
pub use scheduler::{Phase, PhaseAction, RoundScheduler, SchedulerState};
pub use store::{LedgerStore, StorageError};
pub use validator::{BlockValidator, CombinedValidator};
