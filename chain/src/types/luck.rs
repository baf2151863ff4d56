// chain/src/types/luck.rs

//! Verifiable per-round luck values.
//!
//! In luck mode a node draws a random seed each round and derives its luck
//! from `H(public_key, round, seed)`. Publishing the seed together with a
//! signature over `H(seed)` lets every peer recompute and check the value.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{Hash256, PublicKey, Signature};
use crate::crypto::{Wallet, verify_signature};

/// Luck value plus the material needed to verify it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LuckProof {
    /// First 8 bytes of the luck digest, big-endian.
    pub luck_value: u64,
    pub seed: Hash256,
    pub round: u64,
    pub public_key: PublicKey,
    /// Signature over `H(seed)`.
    pub signature: Signature,
}

impl LuckProof {
    /// Draws a fresh seed and produces a signed proof for `round`.
    pub fn generate<R: RngCore>(wallet: &Wallet, round: u64, rng: &mut R) -> Self {
        let mut seed = [0u8; super::HASH_LEN];
        rng.fill_bytes(&mut seed);
        Self::from_seed(wallet, round, Hash256(seed))
    }

    pub fn from_seed(wallet: &Wallet, round: u64, seed: Hash256) -> Self {
        let public_key = wallet.public_key().clone();
        Self {
            luck_value: derive_luck(&public_key, round, &seed),
            signature: wallet.sign(&Hash256::compute(seed.as_bytes())),
            seed,
            round,
            public_key,
        }
    }

    /// Luck normalized into `[0, 1]`.
    pub fn luck(&self) -> f64 {
        self.luck_value as f64 / u64::MAX as f64
    }

    /// Recomputes the luck from the seed and checks the seed signature.
    pub fn verify(&self) -> bool {
        self.luck_value == derive_luck(&self.public_key, self.round, &self.seed)
            && verify_signature(
                &self.public_key,
                &self.signature,
                &Hash256::compute(self.seed.as_bytes()),
            )
    }
}

fn derive_luck(public_key: &PublicKey, round: u64, seed: &Hash256) -> u64 {
    let digest = Hash256::of(&(public_key, round, seed));
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(head)
}
