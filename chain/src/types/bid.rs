// chain/src/types/bid.rs

//! Signed per-round bid commitments.

use serde::{Deserialize, Serialize};

use super::{Hash256, PublicKey, Signature};
use crate::crypto::{Wallet, verify_signature};

/// Signed commitment `{public_key, round, bid_hash, timestamp}`.
///
/// `bid_hash` is the digest of a locally generated secret. Once signed the
/// packet is immutable; any field change invalidates the signature.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BidPacket {
    pub public_key: PublicKey,
    pub round: u64,
    pub bid_hash: Hash256,
    /// Milliseconds since the Unix epoch at signing time.
    pub timestamp: u64,
    pub signature: Signature,
}

impl BidPacket {
    /// Builds and signs a packet for `round`.
    pub fn sign(wallet: &Wallet, round: u64, bid_hash: Hash256, timestamp: u64) -> Self {
        let public_key = wallet.public_key().clone();
        let digest = Self::signing_digest(&public_key, round, &bid_hash, timestamp);
        Self {
            public_key,
            round,
            bid_hash,
            timestamp,
            signature: wallet.sign(&digest),
        }
    }

    fn signing_digest(pk: &PublicKey, round: u64, bid_hash: &Hash256, timestamp: u64) -> Hash256 {
        Hash256::of(&(pk, round, bid_hash, timestamp))
    }

    /// Digest covered by the signature.
    pub fn digest(&self) -> Hash256 {
        Self::signing_digest(&self.public_key, self.round, &self.bid_hash, self.timestamp)
    }

    pub fn verify(&self) -> bool {
        verify_signature(&self.public_key, &self.signature, &self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn signed_bid_verifies_and_detects_tampering() {
        let w = Wallet::generate(&mut StdRng::seed_from_u64(11));
        let bid = BidPacket::sign(&w, 42, Hash256::compute(b"secret"), 5_000);
        assert!(bid.verify());

        let mut later = bid.clone();
        later.round = 43;
        assert!(!later.verify());

        let mut swapped = bid;
        swapped.bid_hash = Hash256::compute(b"other");
        assert!(!swapped.verify());
    }
}
