//! Base validity predicate for blocks.
//!
//! This validator enforces cheap, deterministic invariants that do not
//! depend on the parent block, such as:
//!
//! - block size and transaction count limits,
//! - absence of duplicate transaction ids within a single block.

use std::collections::HashSet;

use crate::consensus::config::ConsensusConfig;
use crate::consensus::error::ValidationError;
use crate::consensus::validator::BlockValidator;
use crate::types::{Block, canonical_bytes};

/// Base validity predicate for blocks.
///
/// This struct is configured using [`ConsensusConfig`] and performs
/// purely block-local checks that are inexpensive to run.
#[derive(Clone, Debug)]
pub struct BaseValidity {
    max_block_txs: usize,
    max_block_size_bytes: usize,
}

impl BaseValidity {
    /// Constructs a new `BaseValidity` from the consensus configuration.
    pub fn new(cfg: &ConsensusConfig) -> Self {
        Self {
            max_block_txs: cfg.max_block_txs,
            max_block_size_bytes: cfg.max_block_size_bytes,
        }
    }

    fn check_tx_count(&self, block: &Block) -> Result<(), ValidationError> {
        let tx_count = block.transactions.len();
        if tx_count > self.max_block_txs {
            return Err(ValidationError::Custom(format!(
                "block has {} txs, exceeds max_block_txs={}",
                tx_count, self.max_block_txs
            )));
        }
        Ok(())
    }

    fn check_block_size(&self, block: &Block) -> Result<(), ValidationError> {
        let size = canonical_bytes(block).len();
        if size > self.max_block_size_bytes {
            return Err(ValidationError::Custom(format!(
                "block size {} bytes exceeds max_block_size_bytes={}",
                size, self.max_block_size_bytes
            )));
        }
        Ok(())
    }

    fn check_duplicate_ids(&self, block: &Block) -> Result<(), ValidationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for tx in &block.transactions {
            if !seen.insert(tx.id.as_str()) {
                return Err(ValidationError::Custom(format!(
                    "duplicate transaction id {} within the same block",
                    tx.id
                )));
            }
        }
        Ok(())
    }
}

impl BlockValidator for BaseValidity {
    fn validate(&self, block: &Block, _parent: &Block) -> Result<(), ValidationError> {
        self.check_tx_count(block)?;
        self.check_block_size(block)?;
        self.check_duplicate_ids(block)?;
        Ok(())
    }
}
