//! Consensus configuration parameters.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Proposer-selection strategy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    /// Bid closest to the candidate block hash wins.
    #[default]
    Bid,
    /// Highest verifiable luck within the slotted broadcast window wins.
    Luck,
}

impl FromStr for ConsensusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bid" => Ok(ConsensusMode::Bid),
            "luck" => Ok(ConsensusMode::Luck),
            other => Err(format!("unknown consensus mode {other:?}, expected bid|luck")),
        }
    }
}

/// Consensus configuration parameters.
///
/// This includes both protocol-level knobs (round timing, quorum and
/// blacklist thresholds) and implementation-level limits (e.g. maximum
/// transactions per block). All durations are in milliseconds and all
/// phase offsets are relative to the start of a round.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Length of one round.
    pub round_interval_ms: u64,
    /// Bid window, measured from the round boundary.
    pub phase1_duration_ms: u64,
    /// Transactions timestamped before `round_start + tx_collection_ms`
    /// belong to the round. Pool synchronization starts here.
    pub tx_collection_ms: u64,
    /// Offset at which the candidate block is computed and proposed.
    pub phase3_start_ms: u64,
    /// Below this many bids no block is proposed for the round.
    pub min_bids_required: usize,
    /// Strikes after which a peer is blacklisted.
    pub malicious_threshold: u32,
    /// Derive rounds from the wall clock only and ignore peer-announced
    /// rounds.
    pub strict_rounds: bool,
    /// Soft limit on the number of transactions per block.
    pub max_block_txs: usize,
    /// Soft limit on the total serialized size of a block, in bytes.
    pub max_block_size_bytes: usize,
    /// Pending transactions older than this many rounds are dropped.
    pub pending_expiry_rounds: u64,
    /// Pending expiry runs once every this many accepted blocks.
    pub pending_cleanup_every_blocks: u64,
    /// How long a block may wait for the local target hash.
    pub target_wait_ms: u64,
    /// Retention of the processed-message ledger.
    pub dedup_retention_ms: u64,
    /// Length of the chain suffix exchanged by suffix sync.
    pub suffix_len: usize,
    /// Number of broadcast slots in luck mode.
    pub luck_slots: u64,
    /// Width of one luck slot.
    pub luck_slot_ms: u64,
    pub mode: ConsensusMode,
}

impl ConsensusConfig {
    /// Milliseconds between the proposal phase and the next boundary.
    pub fn proposal_window_ms(&self) -> u64 {
        self.round_interval_ms.saturating_sub(self.phase3_start_ms)
    }

    /// Maximum age of a pending transaction.
    pub fn pending_max_age_ms(&self) -> u64 {
        self.pending_expiry_rounds * self.round_interval_ms
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_interval_ms: 600_000,
            phase1_duration_ms: 120_000,
            tx_collection_ms: 480_000,
            phase3_start_ms: 540_000,
            min_bids_required: 2,
            malicious_threshold: 3,
            strict_rounds: true,
            max_block_txs: 10_000,
            max_block_size_bytes: 1_000_000,
            pending_expiry_rounds: 3,
            pending_cleanup_every_blocks: 10,
            target_wait_ms: 30_000,
            dedup_retention_ms: 1_000,
            suffix_len: 10,
            luck_slots: 10,
            luck_slot_ms: 3_000,
            mode: ConsensusMode::Bid,
        }
    }
}
