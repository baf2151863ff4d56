//! Local chain state and block admission.
//!
//! The ledger owns the node's chain exclusively. A received block walks
//! through a fixed sequence of checks before it is appended:
//!
//! 1. proposer not blacklisted,
//! 2. hash not already on the chain (re-delivery is a no-op),
//! 3. index beyond the current tip,
//! 4. hash equals the round's independently derived target hash,
//! 5. proposer equals the round's elected proposer,
//! 6. the configured [`BlockValidator`] (hash, signature, linkage, ...).
//!
//! Accepted blocks are persisted through the [`LedgerStore`] before the
//! in-memory chain changes.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::types::{Block, BlockHash};

use super::error::{ConsensusError, ValidationError};
use super::malicious::MaliciousRecord;
use super::proposer::RoundTarget;
use super::store::LedgerStore;
use super::validator::BlockValidator;

/// Validates a whole chain: shared genesis plus every parent/child pair.
pub fn validate_chain<V: BlockValidator>(validator: &V, chain: &[Block]) -> Result<(), ValidationError> {
    match chain.first() {
        Some(first) if *first == Block::genesis() => {}
        _ => return Err(ValidationError::BadGenesis),
    }
    for pair in chain.windows(2) {
        validator.validate(&pair[1], &pair[0])?;
    }
    Ok(())
}

/// The local chain plus its persistence and validity predicate.
pub struct Ledger<S, V> {
    chain: Vec<Block>,
    hashes: HashSet<BlockHash>,
    store: S,
    validator: V,
}

impl<S, V> Ledger<S, V>
where
    S: LedgerStore,
    V: BlockValidator,
{
    /// Loads the persisted chain, falling back to genesis when the store
    /// is empty or holds an invalid chain.
    pub fn open(mut store: S, validator: V) -> Result<Self, ConsensusError> {
        let loaded = store.load_chain()?;
        let chain = if loaded.is_empty() {
            let chain = vec![Block::genesis()];
            store.replace_chain(&chain)?;
            chain
        } else if let Err(e) = validate_chain(&validator, &loaded) {
            warn!(error = %e, "persisted chain invalid, resetting to genesis");
            let chain = vec![Block::genesis()];
            store.replace_chain(&chain)?;
            chain
        } else {
            loaded
        };

        let hashes = chain.iter().map(|b| b.hash).collect();
        info!(height = chain.len() - 1, "ledger opened");
        Ok(Self {
            chain,
            hashes,
            store,
            validator,
        })
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Latest block. The chain always holds at least genesis.
    pub fn tip(&self) -> &Block {
        &self.chain[self.chain.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn block(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.chain.get(i))
    }

    /// Last `n` blocks (fewer if the chain is shorter).
    pub fn suffix(&self, n: usize) -> &[Block] {
        let start = self.chain.len().saturating_sub(n);
        &self.chain[start..]
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn validator(&self) -> &V {
        &self.validator
    }

    /// Admits a block proposed for `target`'s round.
    pub fn add_block(
        &mut self,
        block: Block,
        malicious: &MaliciousRecord,
        target: &RoundTarget,
    ) -> Result<(), ConsensusError> {
        if malicious.is_blacklisted(&block.proposer) {
            return Err(ConsensusError::Blacklisted(block.proposer));
        }
        if self.contains(&block.hash) {
            return Err(ConsensusError::DuplicateDelivery);
        }
        let tip_index = self.tip().index;
        if block.index <= tip_index {
            return Err(ConsensusError::StaleOrFutureRound {
                expected: tip_index + 1,
                got: block.index,
            });
        }
        if block.hash != target.hash() {
            return Err(ConsensusError::ConsensusMismatch(format!(
                "block {} differs from round target {}",
                block.hash.0.short(),
                target.hash().0.short()
            )));
        }
        if block.proposer != target.proposer {
            return Err(ConsensusError::ConsensusMismatch(format!(
                "proposer {} is not the elected {}",
                block.proposer.short(),
                target.proposer.short()
            )));
        }
        self.append(block)
    }

    /// Validates `block` against the tip, persists it and appends it.
    pub fn append(&mut self, block: Block) -> Result<(), ConsensusError> {
        self.validator.validate(&block, self.tip())?;
        self.store.append_block(&block)?;
        info!(index = block.index, hash = %block.hash.0.short(), proposer = %block.proposer.short(), "block appended");
        self.hashes.insert(block.hash);
        self.chain.push(block);
        Ok(())
    }

    /// Swaps the tip for a competing block at the same index.
    pub fn replace_tip(&mut self, block: Block) -> Result<(), ConsensusError> {
        if self.chain.len() < 2 {
            return Err(ConsensusError::MalformedInput("cannot replace genesis".into()));
        }
        let parent = &self.chain[self.chain.len() - 2];
        self.validator.validate(&block, parent)?;

        let mut next = self.chain[..self.chain.len() - 1].to_vec();
        next.push(block);
        self.install(next)
    }

    /// Replaces the whole chain after validating it.
    pub fn replace_chain(&mut self, chain: Vec<Block>) -> Result<(), ConsensusError> {
        validate_chain(&self.validator, &chain)?;
        self.install(chain)
    }

    /// Replaces everything after the suffix's anchor block.
    ///
    /// The block preceding `suffix[0]` must already be on the local chain
    /// and the suffix must link to it.
    pub fn replace_suffix(&mut self, suffix: Vec<Block>) -> Result<(), ConsensusError> {
        let first = suffix
            .first()
            .ok_or_else(|| ConsensusError::MalformedInput("empty chain suffix".into()))?;
        let anchor_index = first
            .index
            .checked_sub(1)
            .ok_or_else(|| ConsensusError::MalformedInput("suffix starts at genesis".into()))?;
        let anchor = self.block(anchor_index).ok_or_else(|| {
            ConsensusError::ConsensusMismatch(format!("suffix anchor {anchor_index} not held locally"))
        })?;

        self.validator.validate(first, anchor)?;
        for pair in suffix.windows(2) {
            self.validator.validate(&pair[1], &pair[0])?;
        }

        let keep = usize::try_from(anchor_index)
            .map_err(|_| ConsensusError::MalformedInput("suffix index overflow".into()))?
            + 1;
        let mut next = self.chain[..keep].to_vec();
        next.extend(suffix);
        self.install(next)
    }

    fn install(&mut self, chain: Vec<Block>) -> Result<(), ConsensusError> {
        self.store.replace_chain(&chain)?;
        info!(
            height = chain.len() - 1,
            tip = %chain[chain.len() - 1].hash.0.short(),
            "chain replaced"
        );
        self.hashes = chain.iter().map(|b| b.hash).collect();
        self.chain = chain;
        Ok(())
    }
}
