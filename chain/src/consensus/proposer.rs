//! Round target derivation and block proposal.
//!
//! Every node assembles the same candidate block for a round from the
//! same transaction set and bid list. The candidate's hash is the round's
//! target hash, and the bid closest to it names the expected proposer.
//! Only that proposer seals and broadcasts the block; everyone else waits
//! for it and checks it against their own target.

use std::collections::BTreeSet;

use crate::crypto::Wallet;
use crate::types::{BidEntry, Block, BlockHash, PublicKey, Transaction, TxId};

use super::config::ConsensusConfig;
use super::selector::{closest_bid, sort_bids};

/// Abstract transaction pool interface.
///
/// Consensus does not care how transactions are stored or gossiped; it only
/// needs the round's deterministic transaction set.
pub trait TxPool {
    /// Transactions stamped before `round_start + collection_ms`, ordered
    /// by `(timestamp, id)`.
    fn round_set(&self, round_start: u64, collection_ms: u64) -> Vec<Transaction>;

    /// Exactly the transactions for `ids`, or `None` if any is missing.
    fn select(&self, ids: &BTreeSet<TxId>) -> Option<Vec<Transaction>>;
}

/// The independently computed expectation for one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundTarget {
    pub round: u64,
    /// Unsigned candidate block; its hash is the target hash.
    pub candidate: Block,
    /// Identity whose bid is closest to the target hash.
    pub proposer: PublicKey,
}

impl RoundTarget {
    pub fn hash(&self) -> BlockHash {
        self.candidate.hash
    }

    pub fn index(&self) -> u64 {
        self.candidate.index
    }
}

/// Configurable block proposer.
///
/// This struct is deliberately stateless with respect to the chain; the
/// tip, the transactions and the bids are provided at call time.
#[derive(Clone, Debug)]
pub struct Proposer {
    pub max_block_txs: usize,
}

impl Proposer {
    /// Constructs a proposer from a [`ConsensusConfig`].
    pub fn from_config(cfg: &ConsensusConfig) -> Self {
        Self {
            max_block_txs: cfg.max_block_txs,
        }
    }

    /// Picks the round's transactions from `pool`, honouring an adopted
    /// majority set when pool synchronization produced one.
    pub fn round_transactions<P: TxPool>(
        &self,
        pool: &P,
        round_start: u64,
        collection_ms: u64,
        adopted: Option<&BTreeSet<TxId>>,
    ) -> Vec<Transaction> {
        let mut txs = adopted
            .and_then(|ids| pool.select(ids))
            .unwrap_or_else(|| pool.round_set(round_start, collection_ms));
        txs.truncate(self.max_block_txs);
        txs
    }

    /// Builds the candidate on top of `tip` and elects its proposer.
    ///
    /// Returns `None` when there are no bids.
    pub fn derive_target(
        &self,
        round: u64,
        tip: &Block,
        mut transactions: Vec<Transaction>,
        mut bids: Vec<BidEntry>,
    ) -> Option<RoundTarget> {
        sort_bids(&mut bids);
        transactions.truncate(self.max_block_txs);
        let candidate = Block::candidate(tip.index + 1, tip.hash, transactions, bids);
        let proposer = closest_bid(&candidate.bid_hash_list, &candidate.hash.0)?
            .public_key
            .clone();
        Some(RoundTarget {
            round,
            candidate,
            proposer,
        })
    }

    /// Seals the target's candidate with `wallet`.
    ///
    /// The timestamp is bumped past the tip's if the local clock lags.
    pub fn seal(&self, target: &RoundTarget, tip: &Block, wallet: &Wallet, now_ms: u64) -> Block {
        let timestamp = now_ms.max(tip.timestamp + 1);
        target.candidate.clone().seal(wallet, timestamp)
    }
}
