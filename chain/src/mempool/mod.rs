//! Transaction pool and Merkle-root based pool synchronization.

pub mod pool;
pub mod sync;

pub use pool::TransactionPool;
pub use sync::{SyncOutcome, TransactionSynchronizer, find_missing, merkle_root};
