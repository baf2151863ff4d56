use thiserror::Error;

use crate::types::PublicKey;

use super::store::StorageError;

/// Error type returned when a block fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid block: hash does not match contents")]
    HashMismatch,

    #[error("invalid block: proposer signature does not verify")]
    BadSignature,

    #[error("invalid block: index {got}, expected {expected}")]
    BadIndex { expected: u64, got: u64 },

    #[error("invalid block: previous hash does not match parent")]
    PreviousHashMismatch,

    #[error("invalid block: timestamp {got} not after parent {parent}")]
    NonIncreasingTimestamp { parent: u64, got: u64 },

    #[error("invalid block: merkle root does not match transactions")]
    MerkleRootMismatch,

    #[error("invalid block: transaction {0} failed verification")]
    InvalidTransaction(String),

    #[error("invalid chain: genesis differs")]
    BadGenesis,

    /// Block is invalid with a dynamic error message.
    #[error("invalid block: {0}")]
    Custom(String),
}

/// High-level errors that can occur in the consensus engine.
///
/// None of these are fatal to the node: the runtime logs them and drops
/// the offending message.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Payload could not be interpreted.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A signed claim did not verify.
    #[error("invalid signature on {0}")]
    SignatureInvalid(&'static str),

    #[error("round {got} outside accepted round {expected}")]
    StaleOrFutureRound { expected: u64, got: u64 },

    /// Target hash or proposer mismatch. Triggers synchronization.
    #[error("consensus mismatch: {0}")]
    ConsensusMismatch(String),

    #[error("insufficient quorum: {have} of {need} required")]
    InsufficientQuorum { have: usize, need: usize },

    /// Message already handled; idempotent no-op.
    #[error("duplicate delivery")]
    DuplicateDelivery,

    #[error("peer {0} is blacklisted")]
    Blacklisted(PublicKey),

    /// Underlying validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Storage-related failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConsensusError {
    /// Short label used for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusError::MalformedInput(_) => "malformed_input",
            ConsensusError::SignatureInvalid(_) => "signature_invalid",
            ConsensusError::StaleOrFutureRound { .. } => "stale_or_future_round",
            ConsensusError::ConsensusMismatch(_) => "consensus_mismatch",
            ConsensusError::InsufficientQuorum { .. } => "insufficient_quorum",
            ConsensusError::DuplicateDelivery => "duplicate_delivery",
            ConsensusError::Blacklisted(_) => "blacklisted",
            ConsensusError::Validation(_) => "validation",
            ConsensusError::Storage(_) => "storage",
        }
    }
}
