//! RocksDB-backed ledger store.
//!
//! This implementation persists the chain and node metadata in a RocksDB
//! instance with dedicated column families:
//!
//! - `"blocks"`: maps the big-endian block index (8 bytes) -> canonical
//!   block bytes, so an iterator walks the chain in order,
//! - `"meta"`: stores the tip index under `"tip"`, the malicious-peer
//!   snapshot under `"malicious_nodes"` and the node's secret key under
//!   `"wallet_key"`.

use std::{path::Path, sync::Arc};

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::consensus::malicious::MaliciousSnapshot;
use crate::consensus::store::{LedgerStore, StorageError};
use crate::types::{Block, canonical_bytes};

const CF_BLOCKS: &str = "blocks";
const CF_META: &str = "meta";
const KEY_TIP: &[u8] = b"tip";
const KEY_MALICIOUS: &[u8] = b"malicious_nodes";
const KEY_WALLET: &[u8] = b"wallet_key";

/// Configuration for [`RocksDbLedgerStore`].
#[derive(Clone, Debug)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if they
    /// do not yet exist.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/chain-db".to_string(),
            create_if_missing: true,
        }
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// RocksDB-backed implementation of [`LedgerStore`].
pub struct RocksDbLedgerStore {
    db: DB,
}

impl RocksDbLedgerStore {
    /// Opens (or creates) a RocksDB-backed store at the given path.
    ///
    /// This sets up the `"blocks"` and `"meta"` column families. The
    /// `"default"` column family is also created to keep RocksDB happy,
    /// but it is not used.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StorageError> {
        let path = Path::new(&cfg.path);

        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let cfs = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self { db })
    }

    fn cf_blocks(&self) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(CF_BLOCKS)
            .ok_or(StorageError::MissingColumnFamily(CF_BLOCKS))
    }

    fn cf_meta(&self) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(CF_META)
            .ok_or(StorageError::MissingColumnFamily(CF_META))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
        let cfg = bincode::config::standard();
        let (value, _): (T, usize) = bincode::serde::decode_from_slice(bytes, cfg)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(value)
    }

    fn encode<T: Serialize>(value: &T) -> Vec<u8> {
        canonical_bytes(value)
    }

    fn load_tip(&self) -> Result<Option<u64>, StorageError> {
        let cf_meta = self.cf_meta()?;
        match self.db.get_cf(&cf_meta, KEY_TIP)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("tip index length"))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
        }
    }

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let cf_meta = self.cf_meta()?;
        Ok(self.db.get_cf(&cf_meta, key)?)
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let cf_meta = self.cf_meta()?;
        self.db.put_cf(&cf_meta, key, value)?;
        Ok(())
    }
}

impl LedgerStore for RocksDbLedgerStore {
    fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let Some(tip) = self.load_tip()? else {
            return Ok(Vec::new());
        };
        let cf = self.cf_blocks()?;
        let mut chain = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let key: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Corrupted("block key length"))?;
            if u64::from_be_bytes(key) > tip {
                break;
            }
            chain.push(Self::decode::<Block>(&value)?);
        }
        if chain.len() as u64 != tip + 1 {
            return Err(StorageError::Corrupted("chain has gaps below tip"));
        }
        Ok(chain)
    }

    fn append_block(&mut self, block: &Block) -> Result<(), StorageError> {
        let cf_blocks = self.cf_blocks()?;
        let cf_meta = self.cf_meta()?;
        let key = block.index.to_be_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_blocks, key, Self::encode(block));
        batch.put_cf(&cf_meta, KEY_TIP, key);
        self.db.write(batch)?;
        Ok(())
    }

    fn replace_chain(&mut self, chain: &[Block]) -> Result<(), StorageError> {
        let cf_blocks = self.cf_blocks()?;
        let cf_meta = self.cf_meta()?;

        let mut batch = WriteBatch::default();
        for block in chain {
            batch.put_cf(&cf_blocks, block.index.to_be_bytes(), Self::encode(block));
        }
        match chain.last() {
            Some(tip) => {
                // Blocks above the new tip are left behind and ignored by
                // `load_chain`, which stops at the recorded tip.
                batch.put_cf(&cf_meta, KEY_TIP, tip.index.to_be_bytes());
            }
            None => batch.delete_cf(&cf_meta, KEY_TIP),
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn load_malicious(&self) -> Result<Option<MaliciousSnapshot>, StorageError> {
        self.get_meta(KEY_MALICIOUS)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    fn save_malicious(&mut self, snapshot: &MaliciousSnapshot) -> Result<(), StorageError> {
        self.put_meta(KEY_MALICIOUS, &Self::encode(snapshot))
    }

    fn load_wallet_secret(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.get_meta(KEY_WALLET)
    }

    fn save_wallet_secret(&mut self, secret: &[u8]) -> Result<(), StorageError> {
        self.put_meta(KEY_WALLET, secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::types::PublicKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> RocksDbLedgerStore {
        let cfg = RocksDbConfig {
            path: tmp.path().to_string_lossy().to_string(),
            create_if_missing: true,
        };
        RocksDbLedgerStore::open(&cfg).expect("open RocksDB")
    }

    fn chain_of(n: u64) -> Vec<Block> {
        let w = Wallet::generate(&mut StdRng::seed_from_u64(71));
        let mut chain = vec![Block::genesis()];
        for i in 1..=n {
            let prev = &chain[chain.len() - 1];
            let b = Block::candidate(i, prev.hash, vec![], vec![]).seal(&w, i);
            chain.push(b);
        }
        chain
    }

    #[test]
    fn rocksdb_store_roundtrip_chain() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut store = open(&tmp);
        assert!(store.load_chain().expect("load").is_empty());

        let chain = chain_of(3);
        for b in &chain {
            store.append_block(b).expect("append");
        }
        assert_eq!(store.load_chain().expect("load"), chain);
    }

    #[test]
    fn replacing_with_a_shorter_chain_moves_the_tip() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut store = open(&tmp);
        let long = chain_of(4);
        store.replace_chain(&long).expect("replace");

        let short = long[..2].to_vec();
        store.replace_chain(&short).expect("replace");
        assert_eq!(store.load_chain().expect("load"), short);
    }

    #[test]
    fn metadata_survives_reopen() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut snap = MaliciousSnapshot::default();
        snap.counts.insert(PublicKey(vec![2, 9]), 3);
        snap.blacklisted.insert(PublicKey(vec![2, 9]));
        {
            let mut store = open(&tmp);
            store.save_malicious(&snap).expect("save");
            store.save_wallet_secret(&[5u8; 32]).expect("save");
            store.append_block(&Block::genesis()).expect("append");
        }

        let store = open(&tmp);
        assert_eq!(store.load_malicious().expect("load"), Some(snap));
        assert_eq!(store.load_wallet_secret().expect("load"), Some(vec![5u8; 32]));
        assert_eq!(store.load_chain().expect("load"), vec![Block::genesis()]);
    }
}
