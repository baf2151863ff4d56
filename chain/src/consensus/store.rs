//! Storage abstraction used by the consensus engine.

use thiserror::Error;

use crate::types::Block;

use super::malicious::MaliciousSnapshot;

/// Storage-level error type.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying backend error (e.g. RocksDB I/O).
    #[error("storage backend: {0}")]
    Backend(String),

    /// Required column family was not found.
    #[error("missing column family {0:?}")]
    MissingColumnFamily(&'static str),

    /// Value could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),

    /// Corrupted or malformed metadata (e.g. a tip index with wrong length).
    #[error("corrupted: {0}")]
    Corrupted(&'static str),
}

/// Abstract persistence interface used by the consensus engine.
///
/// Implementations can be backed by in-memory maps, RocksDB, etc. The
/// interface is intentionally small: consensus only needs get/put of the
/// chain, the malicious-peer record and the node's own wallet key.
pub trait LedgerStore {
    /// Loads the persisted chain in index order. Empty if nothing stored.
    fn load_chain(&self) -> Result<Vec<Block>, StorageError>;

    /// Persists a block that extends the current tip.
    fn append_block(&mut self, block: &Block) -> Result<(), StorageError>;

    /// Replaces the whole persisted chain.
    fn replace_chain(&mut self, chain: &[Block]) -> Result<(), StorageError>;

    fn load_malicious(&self) -> Result<Option<MaliciousSnapshot>, StorageError>;

    fn save_malicious(&mut self, snapshot: &MaliciousSnapshot) -> Result<(), StorageError>;

    fn load_wallet_secret(&self) -> Result<Option<Vec<u8>>, StorageError>;

    fn save_wallet_secret(&mut self, secret: &[u8]) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal dummy store; good for checking trait-object use without
    /// caring about real persistence.
    #[derive(Default)]
    struct DummyStore {
        appended: usize,
    }

    impl LedgerStore for DummyStore {
        fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
            Ok(Vec::new())
        }

        fn append_block(&mut self, _block: &Block) -> Result<(), StorageError> {
            self.appended += 1;
            Ok(())
        }

        fn replace_chain(&mut self, chain: &[Block]) -> Result<(), StorageError> {
            self.appended = chain.len();
            Ok(())
        }

        fn load_malicious(&self) -> Result<Option<MaliciousSnapshot>, StorageError> {
            Ok(None)
        }

        fn save_malicious(&mut self, _snapshot: &MaliciousSnapshot) -> Result<(), StorageError> {
            Ok(())
        }

        fn load_wallet_secret(&self) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Corrupted("wallet key"))
        }

        fn save_wallet_secret(&mut self, _secret: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn ledger_store_trait_is_object_safe() {
        fn use_trait_object(store: &mut dyn LedgerStore) -> usize {
            store.append_block(&Block::genesis()).expect("append");
            store.load_chain().expect("load").len()
        }

        let mut store = DummyStore::default();
        assert_eq!(use_trait_object(&mut store), 0);
        assert_eq!(store.appended, 1);
    }

    #[test]
    fn storage_errors_render_their_cause() {
        let store = DummyStore::default();
        let err = store.load_wallet_secret().unwrap_err();
        assert_eq!(err.to_string(), "corrupted: wallet key");
    }
}
