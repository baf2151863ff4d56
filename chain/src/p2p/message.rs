//! Wire messages exchanged between peers.
//!
//! Every message is one JSON object carrying a `type` discriminator, e.g.
//! `{"type":"BID","public_key":"02..","round":7,...}`. Cross-peer claims
//! carry the sender's public key and a signature over a domain-separated
//! digest of the payload; receivers verify it before touching any state.

use serde::{Deserialize, Serialize};

use crate::consensus::malicious::MaliciousSnapshot;
use crate::crypto::{Wallet, verify_signature};
use crate::types::{
    BidPacket, Block, BlockHash, Hash256, PublicKey, Signature, Transaction, simplified_chain_hash,
};

/// A payload signed by one identity.
pub trait Signed {
    /// Domain-separated digest covered by the signature.
    fn digest(&self) -> Hash256;
    fn signer(&self) -> &PublicKey;
    fn signature(&self) -> &Signature;

    fn verify(&self) -> bool {
        verify_signature(self.signer(), self.signature(), &self.digest())
    }
}

macro_rules! signed_by_public_key {
    ($ty:ty) => {
        impl Signed for $ty {
            fn digest(&self) -> Hash256 {
                self.signing_digest()
            }
            fn signer(&self) -> &PublicKey {
                &self.public_key
            }
            fn signature(&self) -> &Signature {
                &self.signature
            }
        }
    };
}

/// Full chain or chain suffix announced by a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnnouncement {
    pub blocks: Vec<Block>,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl ChainAnnouncement {
    pub fn new(wallet: &Wallet, blocks: Vec<Block>) -> Self {
        let mut msg = Self {
            blocks,
            public_key: wallet.public_key().clone(),
            signature: Signature::default(),
        };
        msg.signature = wallet.sign(&msg.signing_digest());
        msg
    }

    /// Hash of the simplified chain, which is what peers vote on.
    pub fn chain_hash(&self) -> Hash256 {
        simplified_chain_hash(&self.blocks)
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&("CHAIN", self.chain_hash(), &self.public_key))
    }
}

signed_by_public_key!(ChainAnnouncement);

/// Round number announcement, used only when rounds are peer-driven.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAnnouncement {
    pub round: u64,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl RoundAnnouncement {
    pub fn new(wallet: &Wallet, round: u64) -> Self {
        let public_key = wallet.public_key().clone();
        let digest = Hash256::of(&("ROUND", round, &public_key));
        Self {
            round,
            signature: wallet.sign(&digest),
            public_key,
        }
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&("ROUND", self.round, &self.public_key))
    }
}

signed_by_public_key!(RoundAnnouncement);

/// Request for peers' chains. `suffix` asks for the last blocks only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequest {
    pub suffix: bool,
    pub timestamp: u64,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl ChainRequest {
    pub fn new(wallet: &Wallet, suffix: bool, timestamp: u64) -> Self {
        let public_key = wallet.public_key().clone();
        let digest = Hash256::of(&("CHAIN_VOTE_REQUEST", suffix, timestamp, &public_key));
        Self {
            suffix,
            timestamp,
            signature: wallet.sign(&digest),
            public_key,
        }
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&("CHAIN_VOTE_REQUEST", self.suffix, self.timestamp, &self.public_key))
    }
}

signed_by_public_key!(ChainRequest);

/// One identity's vote for a round's block hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVote {
    pub round: u64,
    pub hash: BlockHash,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl BlockVote {
    pub fn new(wallet: &Wallet, round: u64, hash: BlockHash) -> Self {
        let public_key = wallet.public_key().clone();
        let digest = Hash256::of(&("BLOCK_VOTE", round, &hash, &public_key));
        Self {
            round,
            hash,
            signature: wallet.sign(&digest),
            public_key,
        }
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&("BLOCK_VOTE", self.round, &self.hash, &self.public_key))
    }
}

signed_by_public_key!(BlockVote);

/// A peer's malicious-record snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaliciousData {
    pub snapshot: MaliciousSnapshot,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl MaliciousData {
    pub fn new(wallet: &Wallet, snapshot: MaliciousSnapshot) -> Self {
        let public_key = wallet.public_key().clone();
        let digest = Hash256::of(&("MALICIOUS_DATA", snapshot.digest(), &public_key));
        Self {
            snapshot,
            signature: wallet.sign(&digest),
            public_key,
        }
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&("MALICIOUS_DATA", self.snapshot.digest(), &self.public_key))
    }
}

signed_by_public_key!(MaliciousData);

/// Merkle root of the sender's round transaction set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRootMsg {
    pub round: u64,
    pub root: Hash256,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl MerkleRootMsg {
    pub fn new(wallet: &Wallet, round: u64, root: Hash256) -> Self {
        let public_key = wallet.public_key().clone();
        let digest = Hash256::of(&("MERKLE_ROOT", round, &root, &public_key));
        Self {
            round,
            root,
            signature: wallet.sign(&digest),
            public_key,
        }
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&("MERKLE_ROOT", self.round, &self.root, &self.public_key))
    }
}

signed_by_public_key!(MerkleRootMsg);

/// Asks `responder` for its round set hashing to `root`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSetRequest {
    pub round: u64,
    pub root: Hash256,
    pub responder: PublicKey,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl TxSetRequest {
    pub fn new(wallet: &Wallet, round: u64, root: Hash256, responder: PublicKey) -> Self {
        let mut msg = Self {
            round,
            root,
            responder,
            public_key: wallet.public_key().clone(),
            signature: Signature::default(),
        };
        msg.signature = wallet.sign(&msg.signing_digest());
        msg
    }

    fn signing_digest(&self) -> Hash256 {
        Hash256::of(&(
            "TRANSACTION_SET_REQUEST",
            self.round,
            &self.root,
            &self.responder,
            &self.public_key,
        ))
    }
}

signed_by_public_key!(TxSetRequest);

/// The responder's round transaction set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSet {
    pub round: u64,
    pub transactions: Vec<Transaction>,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl TxSet {
    pub fn new(wallet: &Wallet, round: u64, transactions: Vec<Transaction>) -> Self {
        let mut msg = Self {
            round,
            transactions,
            public_key: wallet.public_key().clone(),
            signature: Signature::default(),
        };
        msg.signature = wallet.sign(&msg.signing_digest());
        msg
    }

    fn signing_digest(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash).collect();
        Hash256::of(&("TRANSACTION_SET", self.round, &hashes, &self.public_key))
    }
}

signed_by_public_key!(TxSet);

/// Every message a node sends or receives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Full chain.
    Chain(ChainAnnouncement),
    /// Last blocks of the sender's chain.
    #[serde(rename = "LAST_10_BLOCKS")]
    LastBlocks(ChainAnnouncement),
    Transaction(Transaction),
    Block(Block),
    Round(RoundAnnouncement),
    Bid(BidPacket),
    /// Luck-mode block proposal.
    Proposal(Block),
    ChainVoteRequest(ChainRequest),
    /// Full chain sent in answer to a [`Message::ChainVoteRequest`].
    ChainVoteResponse(ChainAnnouncement),
    RequestBlockVote(BlockVote),
    BlockVoteResponse(BlockVote),
    MaliciousData(MaliciousData),
    MerkleRoot(MerkleRootMsg),
    TransactionSetRequest(TxSetRequest),
    TransactionSet(TxSet),
}

impl Message {
    /// The `type` discriminator, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Chain(_) => "CHAIN",
            Message::LastBlocks(_) => "LAST_10_BLOCKS",
            Message::Transaction(_) => "TRANSACTION",
            Message::Block(_) => "BLOCK",
            Message::Round(_) => "ROUND",
            Message::Bid(_) => "BID",
            Message::Proposal(_) => "PROPOSAL",
            Message::ChainVoteRequest(_) => "CHAIN_VOTE_REQUEST",
            Message::ChainVoteResponse(_) => "CHAIN_VOTE_RESPONSE",
            Message::RequestBlockVote(_) => "REQUEST_BLOCK_VOTE",
            Message::BlockVoteResponse(_) => "BLOCK_VOTE_RESPONSE",
            Message::MaliciousData(_) => "MALICIOUS_DATA",
            Message::MerkleRoot(_) => "MERKLE_ROOT",
            Message::TransactionSetRequest(_) => "TRANSACTION_SET_REQUEST",
            Message::TransactionSet(_) => "TRANSACTION_SET",
        }
    }

    /// Checks the sender's signature (and content hash, where one is
    /// carried) without touching any node state.
    pub fn verify(&self) -> bool {
        match self {
            Message::Chain(m) | Message::LastBlocks(m) | Message::ChainVoteResponse(m) => m.verify(),
            Message::Transaction(tx) => tx.verify(),
            Message::Block(b) | Message::Proposal(b) => b.verify(),
            Message::Round(m) => m.verify(),
            Message::Bid(b) => b.verify(),
            Message::ChainVoteRequest(m) => m.verify(),
            Message::RequestBlockVote(v) | Message::BlockVoteResponse(v) => v.verify(),
            Message::MaliciousData(m) => m.verify(),
            Message::MerkleRoot(m) => m.verify(),
            Message::TransactionSetRequest(m) => m.verify(),
            Message::TransactionSet(m) => m.verify(),
        }
    }

    /// Key for the processed-message ledger.
    ///
    /// Blocks and proposals are keyed by block hash plus proposer so a
    /// re-broadcast of the same block is recognised; every other message
    /// by the digest its sender signed. The signature is part of every
    /// key, so a copy carrying a different signature is never mistaken
    /// for the genuine one.
    pub fn dedup_key(&self) -> Hash256 {
        let (inner, signature) = match self {
            Message::Chain(m) | Message::LastBlocks(m) | Message::ChainVoteResponse(m) => {
                (m.digest(), &m.signature)
            }
            Message::Transaction(tx) => (tx.hash, &tx.signature),
            Message::Block(b) | Message::Proposal(b) => (Hash256::of(&(&b.hash, &b.proposer)), &b.signature),
            Message::Round(m) => (m.digest(), &m.signature),
            Message::Bid(b) => (b.digest(), &b.signature),
            Message::ChainVoteRequest(m) => (m.digest(), &m.signature),
            Message::RequestBlockVote(v) | Message::BlockVoteResponse(v) => (v.digest(), &v.signature),
            Message::MaliciousData(m) => (m.digest(), &m.signature),
            Message::MerkleRoot(m) => (m.digest(), &m.signature),
            Message::TransactionSetRequest(m) => (m.digest(), &m.signature),
            Message::TransactionSet(m) => (m.digest(), &m.signature),
        };
        Hash256::of(&(self.kind(), inner, signature))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
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
    fn type_discriminator_is_on_the_wire() {
        let w = wallet(1);
        let msg = Message::Bid(BidPacket::sign(&w, 3, Hash256::compute(b"s"), 9));
        let json = msg.to_json().expect("encode");
        assert!(json.contains("\"type\":\"BID\""), "{json}");
        assert_eq!(Message::from_json(&json).expect("decode"), msg);

        let suffix = Message::LastBlocks(ChainAnnouncement::new(&w, vec![Block::genesis()]));
        let json = suffix.to_json().expect("encode");
        assert!(json.contains("\"type\":\"LAST_10_BLOCKS\""), "{json}");
        assert_eq!(Message::from_json(&json).expect("decode"), suffix);
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(Message::from_json(r#"{"type":"GOSSIP","x":1}"#).is_err());
        assert!(Message::from_json(r#"{"round":1}"#).is_err());
    }

    #[test]
    fn signed_payloads_verify_and_detect_tampering() {
        let w = wallet(2);
        let mut vote = BlockVote::new(&w, 4, BlockHash(Hash256::compute(b"b")));
        assert!(vote.verify());
        vote.round = 5;
        assert!(!vote.verify());

        let mut root = MerkleRootMsg::new(&w, 4, Hash256::compute(b"r"));
        assert!(root.verify());
        root.public_key = wallet(3).public_key().clone();
        assert!(!root.verify());

        let chain = ChainAnnouncement::new(&w, vec![Block::genesis()]);
        assert!(chain.verify());
        assert!(ChainRequest::new(&w, true, 1).verify());
        assert!(RoundAnnouncement::new(&w, 8).verify());
        assert!(MaliciousData::new(&w, MaliciousSnapshot::default()).verify());
        assert!(TxSetRequest::new(&w, 1, Hash256::ZERO, w.public_key().clone()).verify());
        assert!(TxSet::new(&w, 1, vec![]).verify());
    }

    #[test]
    fn digests_are_domain_separated() {
        let w = wallet(4);
        let h = BlockHash(Hash256::compute(b"x"));
        let vote = BlockVote::new(&w, 1, h);
        let root = MerkleRootMsg::new(&w, 1, h.0);
        assert_ne!(vote.digest(), root.digest());

        let a = Message::RequestBlockVote(vote.clone());
        let b = Message::BlockVoteResponse(vote);
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn forged_copies_do_not_share_the_genuine_key() {
        let w = wallet(5);
        let block = Block::candidate(1, Block::genesis().hash, Vec::new(), Vec::new()).seal(&w, 10);
        let genuine = Message::Block(block.clone());
        let mut bad = block;
        bad.signature = Signature(vec![0x30; 70]);
        let forged = Message::Block(bad);

        assert!(genuine.verify());
        assert!(!forged.verify());
        assert_ne!(genuine.dedup_key(), forged.dedup_key());
        assert_eq!(genuine.dedup_key(), genuine.clone().dedup_key());
    }
}
