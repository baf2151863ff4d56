//! Peer-to-peer layer: wire messages, duplicate suppression and the TCP
//! transport.

pub mod dedup;
pub mod message;
pub mod transport;

pub use dedup::ProcessedMessages;
pub use message::{
    BlockVote, ChainAnnouncement, ChainRequest, MaliciousData, Message, MerkleRootMsg,
    RoundAnnouncement, Signed, TxSet, TxSetRequest,
};
pub use transport::{PeerId, Transport, TransportError, TransportEvent};
