// chain/src/crypto.rs

//! Wallet and signature primitives.
//!
//! Every cross-peer claim in the protocol (bids, blocks, votes, chain
//! announcements, Merkle roots) is signed over a [`Hash256`] digest. This
//! module wraps secp256k1 ECDSA from `k256` behind two small operations,
//! [`Wallet::sign`] and [`verify_signature`], so that the rest of the crate
//! only ever handles the strongly-typed [`PublicKey`] and [`Signature`]
//! newtypes.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use thiserror::Error;

use crate::types::{Hash256, PublicKey, Signature};

/// Errors raised when decoding key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
}

/// Local signing identity of a node.
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Wallet {
    /// Generates a fresh random key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_signing_key(SigningKey::random(rng))
    }

    /// Restores a wallet from a 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))?;
        Ok(Self::from_signing_key(key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let point = signing_key.verifying_key().to_encoded_point(true);
        let public_key = PublicKey(point.as_bytes().to_vec());
        Self {
            signing_key,
            public_key,
        }
    }

    /// Secret scalar bytes, for persistence.
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Signs the 32 bytes of `hash`.
    pub fn sign(&self, hash: &Hash256) -> Signature {
        let sig: EcdsaSignature = self.signing_key.sign(hash.as_bytes());
        Signature(sig.to_bytes().to_vec())
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("public_key", &self.public_key.to_hex())
            .finish_non_exhaustive()
    }
}

/// Checks `signature` over `hash` under `public_key`.
///
/// Malformed keys or signatures simply fail verification; callers never
/// need to distinguish "bad encoding" from "wrong signer".
pub fn verify_signature(public_key: &PublicKey, signature: &Signature, hash: &Hash256) -> bool {
    let Ok(vk) = VerifyingKey::from_sec1_bytes(public_key.as_bytes()) else {
        return false;
    };
    let Ok(sig) = EcdsaSignature::from_slice(signature.as_bytes()) else {
        return false;
    };
    vk.verify(hash.as_bytes(), &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn wallet(seed: u64) -> Wallet {
        Wallet::generate(&mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn sign_then_verify() {
        let w = wallet(1);
        let h = Hash256::compute(b"payload");
        let sig = w.sign(&h);
        assert!(verify_signature(w.public_key(), &sig, &h));
    }

    #[test]
    fn verify_rejects_other_hash_and_other_key() {
        let (a, b) = (wallet(1), wallet(2));
        let h = Hash256::compute(b"payload");
        let sig = a.sign(&h);

        assert!(!verify_signature(a.public_key(), &sig, &Hash256::compute(b"other")));
        assert!(!verify_signature(b.public_key(), &sig, &h));
    }

    #[test]
    fn malformed_material_fails_closed() {
        let h = Hash256::compute(b"x");
        assert!(!verify_signature(&PublicKey(vec![1, 2, 3]), &Signature(vec![0; 64]), &h));
        let w = wallet(3);
        assert!(!verify_signature(w.public_key(), &Signature(vec![9; 5]), &h));
    }

    #[test]
    fn secret_roundtrip_preserves_identity() {
        let w = wallet(4);
        let restored = Wallet::from_secret_bytes(&w.secret_bytes()).expect("restore");
        assert_eq!(restored.public_key(), w.public_key());
        assert!(Wallet::from_secret_bytes(&[0u8; 3]).is_err());
    }
}
