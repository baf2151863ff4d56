//! Core domain types used by the chain
//!
//! This module defines strongly-typed hashes, peer identities and
//! signatures shared across the node, plus the block, bid and transaction
//! records built on top of them. The goal is to avoid "naked" byte
//! buffers and hex strings in public APIs and instead use domain-specific
//! newtypes.
//!
//! All byte-backed newtypes serialize as lowercase hex strings so that
//! JSON wire messages stay readable and identities can be used as JSON
//! object keys.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod bid;
pub mod block;
pub mod luck;
pub mod tx;

pub use bid::BidPacket;
pub use block::{BidEntry, Block, BlockHash, SimplifiedBlock, simplified_chain_hash};
pub use luck::LuckProof;
pub use tx::{Transaction, TxId};

/// Length in bytes of all 256-bit hash types used in this module.
pub const HASH_LEN: usize = 32;

/// Returns the canonical byte representation of any serializable value.
///
/// This uses **bincode 2** with the `standard()` configuration and the
/// `serde` integration. All hashing and signing that depend on a
/// "canonical" form go through this function to avoid format drift.
///
/// # Panics
///
/// Panics if encoding fails. This is considered a programming error,
/// because every consensus type is required to be serializable.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let cfg = bincode::config::standard();
    bincode::serde::encode_to_vec(value, cfg)
        .expect("consensus types should always be serializable with bincode 2 + serde")
}

/// Strongly-typed 256-bit hash wrapper (BLAKE3-256).
///
/// This is the backing representation for block hashes, bid commitments,
/// transaction digests and Merkle roots. Bytes are interpreted big-endian
/// whenever a hash is compared numerically (see
/// [`Hash256::to_u256`]), so the derived `Ord` matches numeric order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash256(pub [u8; HASH_LEN]);

impl Hash256 {
    /// The all-zero hash, used as the genesis parent.
    pub const ZERO: Hash256 = Hash256([0u8; HASH_LEN]);

    /// Computes a new [`Hash256`] as the BLAKE3-256 hash of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let h = blake3::hash(data);
        Hash256(*h.as_bytes())
    }

    /// Hashes the canonical encoding of `value`.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Self {
        Self::compute(&canonical_bytes(value))
    }

    /// Returns the underlying 32-byte hash as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Interprets the hash as an unsigned big-endian 256-bit integer.
    pub fn to_u256(&self) -> primitive_types::U256 {
        primitive_types::U256::from_big_endian(&self.0)
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Hash256(arr))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Peer identity: compressed SEC1 encoding of a secp256k1 public key.
///
/// Identities are ordered lexicographically by their bytes, which is the
/// same order as their lowercase hex encoding. That order is the
/// tie-breaker everywhere the protocol needs one.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    /// Returns the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parses a hex-encoded key. No curve validation happens here.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(PublicKey)
    }

    /// The empty identity carried by the genesis block.
    pub fn genesis() -> Self {
        PublicKey(Vec::new())
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        let n = self.0.len().min(5);
        hex::encode(&self.0[..n])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Detached ECDSA signature bytes (64-byte `r || s`).
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// Returns the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Signature)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_roundtrip_through_json() {
        let h = Hash256::compute(b"bid");
        let json = serde_json::to_string(&h).expect("encode");
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash256 = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, h);
    }

    #[test]
    fn hash_order_matches_numeric_order() {
        let mut low = [0u8; HASH_LEN];
        low[31] = 0xff;
        let mut high = [0u8; HASH_LEN];
        high[0] = 0x01;

        let (low, high) = (Hash256(low), Hash256(high));
        assert!(low < high);
        assert!(low.to_u256() < high.to_u256());
    }

    #[test]
    fn public_key_orders_like_its_hex() {
        let a = PublicKey(vec![0x02, 0x0a]);
        let b = PublicKey(vec![0x02, 0xa0]);
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }

    #[test]
    fn public_key_works_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(PublicKey(vec![1, 2, 3]), 2u32);
        let json = serde_json::to_string(&map).expect("encode");
        assert_eq!(json, "{\"010203\":2}");
        let back: std::collections::BTreeMap<PublicKey, u32> =
            serde_json::from_str(&json).expect("decode");
        assert_eq!(back, map);
    }
}
