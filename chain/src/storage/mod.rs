//! Storage backends for the chain.
//!
//! This module provides concrete implementations of the
//! [`crate::consensus::store::LedgerStore`] trait, including:
//!
//! - an in-memory store ([`mem::InMemoryLedgerStore`]) suitable for tests
//!   and simulations,
//! - a RocksDB-backed store ([`rocksdb::RocksDbLedgerStore`]) for
//!   persistent nodes.

pub mod mem;
pub mod rocksdb;

pub use crate::consensus::store::StorageError;
pub use mem::InMemoryLedgerStore;
pub use rocksdb::{RocksDbConfig, RocksDbLedgerStore};
