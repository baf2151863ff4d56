// chain/src/types/block.rs

//! Block types and hashing.
//!
//! This module defines the block data structure used by the chain,
//! together with the canonical hashing routine and the "simplified"
//! projection used when peers vote on whole chains.
//!
//! A block hash covers only `(index, transactions, previous_hash,
//! bid_hash_list)`. Every honest node can therefore derive the same
//! *candidate* block for a round from the same transaction set and bid
//! list before anyone has signed anything; that candidate's hash is the
//! round's target hash. The proposer identity, the wall-clock timestamp
//! and the signature are attached afterwards by [`Block::seal`].
//!
//! Serialization for hashing is done with **bincode 2** using the `serde`
//! integration, through [`canonical_bytes`](super::canonical_bytes).

use serde::{Deserialize, Serialize};

use super::{Hash256, PublicKey, Signature, Transaction};
use super::luck::LuckProof;
use crate::crypto::{Wallet, verify_signature};
use crate::mempool::merkle_root;

/// Strongly-typed block hash.
///
/// Wrapping the underlying [`Hash256`] avoids passing raw byte arrays
/// around in public APIs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub Hash256);

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One entry of a block's bid snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BidEntry {
    pub public_key: PublicKey,
    pub bid_hash: Hash256,
}

/// A block of the replicated ledger.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Height, 0 for genesis, strictly increasing by one.
    pub index: u64,

    /// Milliseconds since the Unix epoch. Must exceed the parent's.
    pub timestamp: u64,

    /// Ordered transactions included in this block.
    pub transactions: Vec<Transaction>,

    /// Hash of the parent block.
    pub previous_hash: BlockHash,

    /// Identity that sealed the block.
    pub proposer: PublicKey,

    /// Sorted snapshot of the round's bids, so that anyone can re-derive
    /// the elected proposer from the block alone.
    pub bid_hash_list: Vec<BidEntry>,

    /// Merkle root of `transactions`.
    pub merkle_root: Hash256,

    /// Content hash, see [`Block::compute_hash`].
    pub hash: BlockHash,

    /// Proposer's signature over `hash`.
    pub signature: Signature,

    /// Present only for blocks proposed in luck mode.
    #[serde(default)]
    pub luck_proof: Option<LuckProof>,
}

/// Block projection without volatile fields.
///
/// Chain votes compare hashes of `Vec<SimplifiedBlock>` so that peers
/// holding semantically identical chains agree even if they serialized
/// transactions or proofs differently.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedBlock {
    pub index: u64,
    pub hash: BlockHash,
    pub previous_hash: BlockHash,
    pub proposer: PublicKey,
    pub merkle_root: Hash256,
}

impl Block {
    /// Deterministic genesis block shared by every node.
    pub fn genesis() -> Self {
        Self::candidate(0, BlockHash(Hash256::ZERO), Vec::new(), Vec::new())
    }

    /// Builds the unsigned candidate block for a round.
    ///
    /// The returned block has its `hash` and `merkle_root` set, an empty
    /// proposer, timestamp 0 and no signature.
    pub fn candidate(
        index: u64,
        previous_hash: BlockHash,
        transactions: Vec<Transaction>,
        bid_hash_list: Vec<BidEntry>,
    ) -> Self {
        let merkle_root = merkle_root(&transactions);
        let mut block = Block {
            index,
            timestamp: 0,
            transactions,
            previous_hash,
            proposer: PublicKey::genesis(),
            bid_hash_list,
            merkle_root,
            hash: BlockHash::default(),
            signature: Signature::default(),
            luck_proof: None,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Attaches the proposer identity, timestamp and signature.
    pub fn seal(mut self, wallet: &Wallet, timestamp: u64) -> Self {
        self.proposer = wallet.public_key().clone();
        self.timestamp = timestamp;
        self.signature = wallet.sign(&self.hash.0);
        self
    }

    /// Computes the canonical BLAKE3-256 hash of this block.
    ///
    /// Only `(index, transactions, previous_hash, bid_hash_list)` are
    /// covered. This must remain stable across nodes for consensus to
    /// work correctly.
    pub fn compute_hash(&self) -> BlockHash {
        BlockHash(Hash256::of(&(
            self.index,
            &self.transactions,
            &self.previous_hash,
            &self.bid_hash_list,
        )))
    }

    /// Recomputes the hash and checks the proposer's signature.
    pub fn verify(&self) -> bool {
        self.hash == self.compute_hash()
            && verify_signature(&self.proposer, &self.signature, &self.hash.0)
    }

    /// Linkage predicate against the parent block.
    pub fn is_valid_successor(&self, previous: &Block) -> bool {
        self.index == previous.index + 1
            && self.previous_hash == previous.hash
            && self.timestamp > previous.timestamp
    }

    pub fn simplified(&self) -> SimplifiedBlock {
        SimplifiedBlock {
            index: self.index,
            hash: self.hash,
            previous_hash: self.previous_hash,
            proposer: self.proposer.clone(),
            merkle_root: self.merkle_root,
        }
    }
}

/// Hash of the simplified projection of a chain (or chain suffix).
pub fn simplified_chain_hash(blocks: &[Block]) -> Hash256 {
    let simplified: Vec<SimplifiedBlock> = blocks.iter().map(Block::simplified).collect();
    Hash256::of(&simplified)
}
