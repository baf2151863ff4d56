//! Local pool of unconfirmed transactions.
//!
//! Besides the transactions themselves the pool keeps a *pending* buffer:
//! ids that showed up in a foreign proposer's block before the transaction
//! itself reached this node. When such a transaction arrives late it is
//! recognised as already confirmed and dropped instead of being pooled
//! again. Pending entries expire after a configurable age.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::consensus::error::ConsensusError;
use crate::consensus::proposer::TxPool;
use crate::types::{PublicKey, Transaction, TxId};

/// Unconfirmed transactions plus the pending buffer.
#[derive(Debug, Default)]
pub struct TransactionPool {
    transactions: BTreeMap<TxId, Transaction>,
    /// Id -> time first seen in a block.
    pending: BTreeMap<TxId, u64>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies and inserts (or replaces) a transaction.
    ///
    /// Returns `Ok(true)` if the pool changed and the transaction should be
    /// relayed. A transaction whose id is pending is consumed silently.
    pub fn add(&mut self, tx: Transaction) -> Result<bool, ConsensusError> {
        if !tx.verify() {
            return Err(ConsensusError::SignatureInvalid("transaction"));
        }
        if self.pending.remove(&tx.id).is_some() {
            debug!(id = %tx.id, "transaction already confirmed, cleared from pending");
            return Ok(false);
        }
        match self.transactions.get(&tx.id) {
            Some(existing) if existing.hash == tx.hash => Ok(false),
            _ => {
                self.transactions.insert(tx.id.clone(), tx);
                Ok(true)
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// All pooled transactions ordered by `(timestamp, id)`.
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self.transactions.values().cloned().collect();
        txs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        txs
    }

    /// Transactions belonging to the round starting at `round_start`:
    /// those stamped before `round_start + collection_ms`.
    pub fn transactions_for_round(&self, round_start: u64, collection_ms: u64) -> Vec<Transaction> {
        let limit = round_start + collection_ms;
        self.transactions()
            .into_iter()
            .filter(|tx| tx.timestamp < limit)
            .collect()
    }

    /// Returns the transactions for `ids`, ordered like [`Self::transactions`],
    /// or `None` if any id is missing.
    pub fn select_ids(&self, ids: &BTreeSet<TxId>) -> Option<Vec<Transaction>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.transactions.get(id)?.clone());
        }
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Some(out)
    }

    /// Removes a block's transactions from the pool.
    ///
    /// Ids not present locally go to the pending buffer, unless this node
    /// proposed the block itself.
    pub fn remove_confirmed(
        &mut self,
        confirmed: &[Transaction],
        proposer: &PublicKey,
        me: &PublicKey,
        now_ms: u64,
    ) {
        for tx in confirmed {
            if self.transactions.remove(&tx.id).is_none() && proposer != me {
                debug!(id = %tx.id, "confirmed transaction not pooled, marked pending");
                self.pending.insert(tx.id.clone(), now_ms);
            }
        }
    }

    /// Drops pending ids older than `max_age_ms`. Returns how many.
    pub fn expire_pending(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, seen| now_ms.saturating_sub(*seen) <= max_age_ms);
        before - self.pending.len()
    }

    /// Inserts verified transactions whose ids are neither pooled nor
    /// pending. Returns how many were added.
    pub fn merge_missing(&mut self, txs: Vec<Transaction>) -> usize {
        let mut added = 0;
        for tx in txs {
            if !tx.verify() || self.pending.contains_key(&tx.id) || self.contains(&tx.id) {
                continue;
            }
            self.transactions.insert(tx.id.clone(), tx);
            added += 1;
        }
        added
    }
}

impl TxPool for TransactionPool {
    fn round_set(&self, round_start: u64, collection_ms: u64) -> Vec<Transaction> {
        self.transactions_for_round(round_start, collection_ms)
    }

    fn select(&self, ids: &BTreeSet<TxId>) -> Option<Vec<Transaction>> {
        self.select_ids(ids)
    }
}
