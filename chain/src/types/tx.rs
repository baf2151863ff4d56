// chain/src/types/tx.rs

//! Transaction record carried in blocks and pools.
//!
//! The consensus layer treats a transaction as an opaque, hashable, signed
//! record: it never interprets `payload`. What matters is that every node
//! derives the same digest for the same record, since pool contents feed
//! the Merkle root and the deterministic candidate block of each round.

use serde::{Deserialize, Serialize};

use super::{Hash256, PublicKey, Signature};
use crate::crypto::{Wallet, verify_signature};

/// Transaction identifier (UUID v4, hyphenated lowercase).
pub type TxId = String;

/// Signed opaque transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id chosen by the sender.
    pub id: TxId,

    /// Creation time in milliseconds since the Unix epoch.
    ///
    /// Round collection windows compare against this value.
    pub timestamp: u64,

    /// Identity that created and signed the transaction.
    pub sender: PublicKey,

    /// Application payload, not interpreted by consensus.
    pub payload: String,

    /// Digest of `(id, timestamp, sender, payload)`.
    pub hash: Hash256,

    /// Sender's signature over `hash`.
    pub signature: Signature,
}

impl Transaction {
    /// Creates and signs a new transaction with a fresh UUID.
    pub fn new(wallet: &Wallet, payload: impl Into<String>, now_ms: u64) -> Self {
        Self::with_id(wallet, uuid::Uuid::new_v4().to_string(), payload, now_ms)
    }

    /// Creates and signs a transaction with a caller-chosen id.
    pub fn with_id(
        wallet: &Wallet,
        id: impl Into<String>,
        payload: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        let mut tx = Transaction {
            id: id.into(),
            timestamp: now_ms,
            sender: wallet.public_key().clone(),
            payload: payload.into(),
            hash: Hash256::ZERO,
            signature: Signature::default(),
        };
        tx.hash = tx.compute_hash();
        tx.signature = wallet.sign(&tx.hash);
        tx
    }

    /// Recomputes the content digest from the signed fields.
    pub fn compute_hash(&self) -> Hash256 {
        Hash256::of(&(&self.id, self.timestamp, &self.sender, &self.payload))
    }

    /// `true` when the stored hash matches the content and the signature
    /// verifies under `sender`.
    pub fn verify(&self) -> bool {
        self.hash == self.compute_hash() && verify_signature(&self.sender, &self.signature, &self.hash)
    }
}
