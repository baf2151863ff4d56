//! Integrity predicate: hash, signature, linkage and contents.
//!
//! A block passes when, in this order:
//!
//! 1. its hash recomputes from `(index, transactions, previous_hash,
//!    bid_hash_list)`,
//! 2. the signature verifies under the proposer key,
//! 3. index, previous hash and timestamp follow the parent,
//! 4. the Merkle root matches the transactions, and every transaction
//!    carries a valid signature.

use crate::consensus::error::ValidationError;
use crate::consensus::validator::BlockValidator;
use crate::crypto::verify_signature;
use crate::mempool::merkle_root;
use crate::types::Block;

#[derive(Clone, Copy, Debug, Default)]
pub struct IntegrityValidity;

impl BlockValidator for IntegrityValidity {
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), ValidationError> {
        if block.hash != block.compute_hash() {
            return Err(ValidationError::HashMismatch);
        }
        if !verify_signature(&block.proposer, &block.signature, &block.hash.0) {
            return Err(ValidationError::BadSignature);
        }
        if block.index != parent.index + 1 {
            return Err(ValidationError::BadIndex {
                expected: parent.index + 1,
                got: block.index,
            });
        }
        if block.previous_hash != parent.hash {
            return Err(ValidationError::PreviousHashMismatch);
        }
        if block.timestamp <= parent.timestamp {
            return Err(ValidationError::NonIncreasingTimestamp {
                parent: parent.timestamp,
                got: block.timestamp,
            });
        }
        if block.merkle_root != merkle_root(&block.transactions) {
            return Err(ValidationError::MerkleRootMismatch);
        }
        if let Some(tx) = block.transactions.iter().find(|tx| !tx.verify()) {
            return Err(ValidationError::InvalidTransaction(tx.id.clone()));
        }
        Ok(())
    }
}
