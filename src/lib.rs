// Granite Database Engine

pub mod common;
pub mod engine;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::types::{Lsn, PageId, ResourceId, TxnId, Value, PAGE_SIZE};
pub use engine::{EngineConfig, EngineError, StorageEngine};
pub use index::btree::{BTreeError, BTreeIndex};
pub use storage::buffer::{BufferPoolError, BufferPoolManager, ReplacementPolicy, StatsSnapshot};
pub use storage::disk::DiskManager;
pub use transaction::{
    IsolationLevel, LockError, LockManager, LockMode, LogManager, TransactionManager,
};
