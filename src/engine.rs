use std::path::PathBuf;
use std::sync::Arc;
use log::{info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::common::types::{ResourceId, TxnId, Value, PAGE_SIZE};
use crate::index::btree::{BTreeError, BTreeIndex, BTreeIter};
use crate::storage::buffer::{
    BufferPoolError, BufferPoolManager, ReplacementPolicy, StatsSnapshot,
};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::transaction::concurrency::lock_manager::{LockError, LockManager, LockMode};
use crate::transaction::concurrency::transaction::{IsolationLevel, TransactionError};
use crate::transaction::concurrency::transaction_manager::TransactionManager;
use crate::transaction::wal::checkpoint::{CheckpointConfig, CheckpointError, CheckpointManager};
use crate::transaction::wal::log_manager::{LogManager, LogManagerConfig, LogManagerError};
use crate::transaction::wal::recovery::{RecoveryError, RecoveryManager, RecoveryReport};

/// Index id of the engine's primary key space.
const PRIMARY_INDEX_ID: u32 = 1;

/// Engine configuration surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the data file
    pub data_path: PathBuf,
    /// Directory holding the write-ahead log
    pub log_dir: PathBuf,
    /// Page size; must match the engine's compiled page size
    pub page_size: usize,
    /// Buffer pool capacity in pages
    pub pool_size: usize,
    /// Eviction policy for the buffer pool
    pub replacement_policy: ReplacementPolicy,
    /// Force the log durable on every commit
    pub sync_commit: bool,
    /// Default isolation level for new transactions
    pub isolation_level: IsolationLevel,
    /// Seconds between automatic checkpoints
    pub checkpoint_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("granite.db"),
            log_dir: PathBuf::from("logs"),
            page_size: PAGE_SIZE,
            pool_size: 64,
            replacement_policy: ReplacementPolicy::default(),
            sync_commit: true,
            isolation_level: IsolationLevel::default(),
            checkpoint_interval: 300,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown transaction {0}")]
    UnknownTransaction(TxnId),

    #[error(transparent)]
    BufferPool(#[from] BufferPoolError),

    #[error(transparent)]
    BTree(#[from] BTreeError),

    #[error(transparent)]
    Disk(#[from] DiskManagerError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Log(#[from] LogManagerError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The storage engine facade consumed by the schema/query layer.
///
/// Wires the buffer pool, B+Tree, lock manager, and WAL together and
/// enforces the write-ahead ordering: a keyed mutation takes its
/// exclusive lock, appends its log record, and only then mutates the
/// tree. Structural tree mutations are serialized by an internal latch;
/// logical isolation comes from the lock manager.
pub struct StorageEngine {
    config: EngineConfig,
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    log_manager: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
    checkpoint_manager: CheckpointManager,
    index: Arc<BTreeIndex<u64>>,
    tree_latch: RwLock<()>,
}

impl StorageEngine {
    /// Open the engine: wire the components, load or create the tree
    /// root from the metadata page, and run crash recovery.
    pub fn open(config: EngineConfig) -> Result<Self> {
        if config.page_size != PAGE_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "page_size {} is not supported (engine pages are {} bytes)",
                config.page_size, PAGE_SIZE
            )));
        }
        if config.pool_size == 0 {
            return Err(EngineError::InvalidConfig(
                "pool_size must be at least one page".to_string(),
            ));
        }

        let disk_manager = Arc::new(DiskManager::new(&config.data_path)?);
        let buffer_pool = Arc::new(BufferPoolManager::new(
            config.pool_size,
            config.replacement_policy,
            disk_manager.clone(),
        ));

        let log_manager = Arc::new(LogManager::new(LogManagerConfig {
            log_dir: config.log_dir.clone(),
            force_sync: config.sync_commit,
            ..Default::default()
        })?);

        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = Arc::new(TransactionManager::new(
            log_manager.clone(),
            lock_manager.clone(),
        ));

        // Write-ahead ordering: no dirty page reaches the data file before
        // the log records covering it are durable.
        {
            let wal = log_manager.clone();
            buffer_pool.set_pre_flush_hook(Box::new(move || {
                wal.flush().map(|_| ()).map_err(|e| e.to_string())
            }));
        }

        let root = disk_manager.root_page_id();
        let index = if root == 0 {
            let index = BTreeIndex::<u64>::new(buffer_pool.clone())?;
            disk_manager.set_root_page_id(index.root_page_id())?;
            // The empty root must be on disk before any crash, or the
            // tree reopens onto an uninitialized page.
            buffer_pool.flush_page(index.root_page_id())?;
            Arc::new(index)
        } else {
            Arc::new(BTreeIndex::<u64>::open(buffer_pool.clone(), root))
        };

        let checkpoint_manager = CheckpointManager::new(
            log_manager.clone(),
            buffer_pool.clone(),
            CheckpointConfig {
                checkpoint_interval: config.checkpoint_interval,
            },
        );

        let engine = Self {
            config,
            disk_manager,
            buffer_pool,
            log_manager,
            lock_manager,
            txn_manager,
            checkpoint_manager,
            index,
            tree_latch: RwLock::new(()),
        };

        let report = engine.recover()?;
        if report.transactions_rolled_back > 0 || report.operations_redone > 0 {
            info!(
                "recovered database: {} operations redone, {} transactions rolled back",
                report.operations_redone, report.transactions_rolled_back
            );
        }

        Ok(engine)
    }

    /// Run crash recovery against the index. Invoked once from `open`.
    fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.tree_latch.write();
        let mut recovery = RecoveryManager::new(self.log_manager.clone());
        let report = recovery.recover(&self.index)?;

        self.persist_root()?;
        self.buffer_pool.flush_all_pages()?;
        self.disk_manager.sync()?;
        Ok(report)
    }

    /// Begin a transaction at the configured default isolation level.
    pub fn begin_txn(&self) -> Result<TxnId> {
        self.begin_txn_with(self.config.isolation_level)
    }

    pub fn begin_txn_with(&self, isolation: IsolationLevel) -> Result<TxnId> {
        Ok(self.txn_manager.begin_transaction(isolation)?)
    }

    /// Commit. With `sync_commit` the commit record is durable before
    /// this returns; locks are released only after that.
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        Ok(self.txn_manager.commit_transaction(txn_id)?)
    }

    /// Abort: undo the transaction's mutations and release its locks.
    pub fn abort(&self, txn_id: TxnId) -> Result<()> {
        let _guard = self.tree_latch.write();
        self.txn_manager.abort_transaction(txn_id, &self.index)?;
        self.persist_root()?;
        Ok(())
    }

    /// Two-phase commit prepare.
    pub fn prepare(&self, txn_id: TxnId) -> Result<()> {
        Ok(self.txn_manager.prepare_transaction(txn_id)?)
    }

    /// Read a key under the transaction's isolation level.
    pub fn get(&self, txn_id: TxnId, key: u64) -> Result<Option<Value>> {
        let txn = self
            .txn_manager
            .get_transaction(txn_id)
            .ok_or(EngineError::UnknownTransaction(txn_id))?;

        let isolation = txn.isolation_level();
        if !isolation.locks_reads() {
            let _guard = self.tree_latch.read();
            return Ok(self.index.search(&key)?);
        }

        let already_held = txn.holds_lock(key);
        if !already_held {
            self.lock_with_abort(txn_id, key, LockMode::Shared)?;
        }

        let result = {
            let _guard = self.tree_latch.read();
            self.index.search(&key)?
        };

        if !already_held {
            if isolation.releases_read_locks_early() {
                self.lock_manager.unlock(txn_id, key);
            } else {
                txn.track_lock(key);
            }
        }

        Ok(result)
    }

    /// Upsert a key. Returns the replaced value, if any.
    pub fn put(&self, txn_id: TxnId, key: u64, value: Value) -> Result<Option<Value>> {
        self.put_inner(txn_id, key, value, true)
    }

    /// Insert that fails with `DuplicateKey` when the key exists
    /// (caller-chosen policy instead of upsert).
    pub fn put_unique(&self, txn_id: TxnId, key: u64, value: Value) -> Result<()> {
        match self.put_inner(txn_id, key, value, false)? {
            None => Ok(()),
            Some(_) => unreachable!("put_inner rejects duplicates when overwrite is off"),
        }
    }

    fn put_inner(
        &self,
        txn_id: TxnId,
        key: u64,
        value: Value,
        allow_overwrite: bool,
    ) -> Result<Option<Value>> {
        let txn = self
            .txn_manager
            .get_transaction(txn_id)
            .ok_or(EngineError::UnknownTransaction(txn_id))?;

        self.lock_with_abort(txn_id, key, LockMode::Exclusive)?;
        txn.track_lock(key);

        let _guard = self.tree_latch.write();
        let before = self.index.search(&key)?;
        if before.is_some() && !allow_overwrite {
            return Err(BTreeError::DuplicateKey.into());
        }

        let page_id = self.index.locate_leaf(&key)?;
        let key_image = encode(&key);
        let value_image = encode(&value);

        // WAL ordering: the record is appended (and chained) before the
        // tree mutation below is considered final. A failed append aborts
        // the owning transaction.
        let logged = match before {
            Some(old) => txn.log_update(
                PRIMARY_INDEX_ID,
                page_id,
                &key_image,
                &encode(&old),
                &value_image,
            ),
            None => txn.log_insert(PRIMARY_INDEX_ID, page_id, &key_image, &value_image),
        };
        if let Err(e) = logged {
            drop(_guard);
            self.abort_after_log_failure(txn_id);
            return Err(e.into());
        }

        let replaced = self.index.insert(key, value)?;
        self.persist_root()?;
        Ok(replaced)
    }

    /// Delete a key. Fails with `KeyNotFound` when absent.
    pub fn delete(&self, txn_id: TxnId, key: u64) -> Result<Value> {
        let txn = self
            .txn_manager
            .get_transaction(txn_id)
            .ok_or(EngineError::UnknownTransaction(txn_id))?;

        self.lock_with_abort(txn_id, key, LockMode::Exclusive)?;
        txn.track_lock(key);

        let _guard = self.tree_latch.write();
        let before = match self.index.search(&key)? {
            Some(v) => v,
            None => return Err(BTreeError::KeyNotFound.into()),
        };

        let page_id = self.index.locate_leaf(&key)?;
        if let Err(e) = txn.log_delete(
            PRIMARY_INDEX_ID,
            page_id,
            &encode(&key),
            &encode(&before),
        ) {
            drop(_guard);
            self.abort_after_log_failure(txn_id);
            return Err(e.into());
        }

        let removed = self.index.delete(&key)?;
        self.persist_root()?;
        Ok(removed)
    }

    /// Ascending scan over all pairs. The iterator is invalidated by
    /// concurrent structural mutation; serialize externally (e.g. lock
    /// the scanned range or scan between transactions).
    pub fn scan(&self) -> Result<BTreeIter<u64>> {
        let _guard = self.tree_latch.read();
        Ok(self.index.iter()?)
    }

    /// Explicit lock acquisition for callers locking non-key resources.
    pub fn acquire_lock(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<()> {
        let txn = self
            .txn_manager
            .get_transaction(txn_id)
            .ok_or(EngineError::UnknownTransaction(txn_id))?;

        self.lock_with_abort(txn_id, resource, mode)?;
        txn.track_lock(resource);
        Ok(())
    }

    /// Non-blocking lock acquisition: fails with `WouldBlock` instead of
    /// queueing behind a conflicting holder.
    pub fn try_acquire_lock(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<()> {
        let txn = self
            .txn_manager
            .get_transaction(txn_id)
            .ok_or(EngineError::UnknownTransaction(txn_id))?;

        self.lock_manager.try_lock(txn_id, resource, mode)?;
        txn.track_lock(resource);
        Ok(())
    }

    /// Explicit lock release.
    pub fn release_lock(&self, txn_id: TxnId, resource: ResourceId) -> Result<()> {
        if let Some(txn) = self.txn_manager.get_transaction(txn_id) {
            txn.untrack_lock(resource);
        }
        self.lock_manager.unlock(txn_id, resource);
        Ok(())
    }

    /// Flush all dirty pages and write a checkpoint record, bounding the
    /// replay needed by the next recovery.
    pub fn checkpoint(&self) -> Result<()> {
        let active = self.txn_manager.active_transaction_ids();
        self.checkpoint_manager.create_checkpoint(&active)?;
        self.disk_manager.sync()?;
        Ok(())
    }

    /// Buffer pool statistics (observational only).
    pub fn stats(&self) -> StatsSnapshot {
        self.buffer_pool.stats()
    }

    /// Whether the automatic checkpoint interval has elapsed.
    pub fn checkpoint_needed(&self) -> bool {
        self.checkpoint_manager.checkpoint_needed()
    }

    /// Abort anything still active, checkpoint, and flush everything.
    pub fn close(self) -> Result<()> {
        for txn_id in self.txn_manager.active_transaction_ids() {
            let _guard = self.tree_latch.write();
            if let Err(e) = self.txn_manager.abort_transaction(txn_id, &self.index) {
                warn!("failed to abort transaction {} at close: {}", txn_id, e);
            }
        }

        let active = self.txn_manager.active_transaction_ids();
        self.checkpoint_manager.create_checkpoint(&active)?;
        self.log_manager.flush()?;
        self.disk_manager.sync()?;
        Ok(())
    }

    fn lock_with_abort(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<()> {
        match self.lock_manager.lock(txn_id, resource, mode) {
            Ok(()) => Ok(()),
            Err(LockError::DeadlockVictim(victim)) => {
                // The detector picked us; finish the abort it started.
                let _guard = self.tree_latch.write();
                if let Err(e) = self.txn_manager.abort_transaction(txn_id, &self.index) {
                    warn!("failed to abort deadlock victim {}: {}", txn_id, e);
                }
                let _ = self.persist_root();
                Err(LockError::DeadlockVictim(victim).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn abort_after_log_failure(&self, txn_id: TxnId) {
        // Partial logging breaks the durability invariant; the owning
        // transaction cannot continue.
        let _guard = self.tree_latch.write();
        if let Err(e) = self.txn_manager.abort_transaction(txn_id, &self.index) {
            warn!("failed to abort transaction {} after log failure: {}", txn_id, e);
        }
    }

    fn persist_root(&self) -> Result<()> {
        let root = self.index.root_page_id();
        if self.disk_manager.root_page_id() != root {
            self.disk_manager.set_root_page_id(root)?;
        }
        Ok(())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("fixed-width integers always encode")
}
