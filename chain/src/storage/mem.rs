//! In-memory ledger store.
//!
//! This implementation is useful for unit tests, network simulations and
//! throwaway devnets. Nothing survives the process.

use crate::consensus::malicious::MaliciousSnapshot;
use crate::consensus::store::{LedgerStore, StorageError};
use crate::types::Block;

/// In-memory implementation of [`LedgerStore`].
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    blocks: Vec<Block>,
    malicious: Option<MaliciousSnapshot>,
    wallet_secret: Option<Vec<u8>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self.blocks.clone())
    }

    fn append_block(&mut self, block: &Block) -> Result<(), StorageError> {
        self.blocks.push(block.clone());
        Ok(())
    }

    fn replace_chain(&mut self, chain: &[Block]) -> Result<(), StorageError> {
        self.blocks = chain.to_vec();
        Ok(())
    }

    fn load_malicious(&self) -> Result<Option<MaliciousSnapshot>, StorageError> {
        Ok(self.malicious.clone())
    }

    fn save_malicious(&mut self, snapshot: &MaliciousSnapshot) -> Result<(), StorageError> {
        self.malicious = Some(snapshot.clone());
        Ok(())
    }

    fn load_wallet_secret(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.wallet_secret.clone())
    }

    fn save_wallet_secret(&mut self, secret: &[u8]) -> Result<(), StorageError> {
        self.wallet_secret = Some(secret.to_vec());
        Ok(())
    }
}
