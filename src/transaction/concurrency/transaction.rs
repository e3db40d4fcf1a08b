use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, PageId, ResourceId, TxnId};
use crate::transaction::wal::log_manager::LogManager;
use crate::transaction::wal::log_record::{
    KeyOperationContent, LogRecordContent, LogRecordType, TransactionOperationContent,
    wall_clock_secs,
};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Whether reads under this level take shared locks at all.
    pub fn locks_reads(&self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// Whether read locks are released as soon as the read completes
    /// (rather than held to commit).
    pub fn releases_read_locks_early(&self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is not in a state that allows this operation")]
    InvalidState(TxnId),

    #[error("Failed to write to WAL: {0}")]
    LogError(String),

    #[error("Failed to undo an operation: {0}")]
    UndoError(String),

    #[error("Internal transaction error: {0}")]
    InternalError(String),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// One logical operation remembered for rollback.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub record_type: LogRecordType,
    pub index_id: u32,
    pub page_id: PageId,
    pub key: Vec<u8>,
    pub before_image: Option<Vec<u8>>,
}

/// An active database transaction.
///
/// Owns the prev-LSN chain of its log records, the set of resources it
/// holds locks on, and the in-memory undo list that abort replays in
/// reverse.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    isolation_level: IsolationLevel,
    log_manager: Arc<LogManager>,
    first_lsn: AtomicU64,
    last_lsn: AtomicU64,
    undo_log: Mutex<Vec<UndoEntry>>,
    held_locks: Mutex<HashSet<ResourceId>>,
}

impl Transaction {
    pub fn new(txn_id: TxnId, log_manager: Arc<LogManager>, isolation_level: IsolationLevel) -> Self {
        Self {
            id: txn_id,
            state: Mutex::new(TransactionState::Active),
            isolation_level,
            log_manager,
            first_lsn: AtomicU64::new(0),
            last_lsn: AtomicU64::new(0),
            undo_log: Mutex::new(Vec::new()),
            held_locks: Mutex::new(HashSet::new()),
        }
    }

    /// Write the BEGIN record.
    pub fn begin(&self) -> Result<Lsn> {
        let lsn = self
            .log_manager
            .append_log_record(
                self.id,
                0,
                LogRecordType::Begin,
                LogRecordContent::Transaction(TransactionOperationContent {
                    timestamp: wall_clock_secs(),
                    metadata: None,
                }),
            )
            .map_err(|e| TransactionError::LogError(e.to_string()))?;

        self.first_lsn.store(lsn, Ordering::SeqCst);
        self.last_lsn.store(lsn, Ordering::SeqCst);
        Ok(lsn)
    }

    /// Log an insert of a fresh key. The record must be appended before
    /// the tree mutation is considered final (write-ahead ordering).
    pub fn log_insert(
        &self,
        index_id: u32,
        page_id: PageId,
        key: &[u8],
        after_image: &[u8],
    ) -> Result<Lsn> {
        self.require_active()?;

        let lsn = self.append_key_record(
            LogRecordType::Insert,
            index_id,
            page_id,
            key.to_vec(),
            None,
            Some(after_image.to_vec()),
        )?;

        self.undo_log.lock().push(UndoEntry {
            record_type: LogRecordType::Insert,
            index_id,
            page_id,
            key: key.to_vec(),
            before_image: None,
        });
        Ok(lsn)
    }

    /// Log an overwrite of an existing key.
    pub fn log_update(
        &self,
        index_id: u32,
        page_id: PageId,
        key: &[u8],
        before_image: &[u8],
        after_image: &[u8],
    ) -> Result<Lsn> {
        self.require_active()?;

        let lsn = self.append_key_record(
            LogRecordType::Update,
            index_id,
            page_id,
            key.to_vec(),
            Some(before_image.to_vec()),
            Some(after_image.to_vec()),
        )?;

        self.undo_log.lock().push(UndoEntry {
            record_type: LogRecordType::Update,
            index_id,
            page_id,
            key: key.to_vec(),
            before_image: Some(before_image.to_vec()),
        });
        Ok(lsn)
    }

    /// Log the removal of a key.
    pub fn log_delete(
        &self,
        index_id: u32,
        page_id: PageId,
        key: &[u8],
        before_image: &[u8],
    ) -> Result<Lsn> {
        self.require_active()?;

        let lsn = self.append_key_record(
            LogRecordType::Delete,
            index_id,
            page_id,
            key.to_vec(),
            Some(before_image.to_vec()),
            None,
        )?;

        self.undo_log.lock().push(UndoEntry {
            record_type: LogRecordType::Delete,
            index_id,
            page_id,
            key: key.to_vec(),
            before_image: Some(before_image.to_vec()),
        });
        Ok(lsn)
    }

    /// Two-phase commit: force everything so far durable and move to
    /// Prepared. Mutations are refused from here on.
    pub fn prepare(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return Err(TransactionError::InvalidState(self.id));
        }

        let lsn = self
            .log_manager
            .append_log_record(
                self.id,
                self.last_lsn.load(Ordering::SeqCst),
                LogRecordType::Prepare,
                LogRecordContent::Transaction(TransactionOperationContent {
                    timestamp: wall_clock_secs(),
                    metadata: None,
                }),
            )
            .map_err(|e| TransactionError::LogError(e.to_string()))?;
        self.log_manager
            .flush()
            .map_err(|e| TransactionError::LogError(e.to_string()))?;

        self.last_lsn.store(lsn, Ordering::SeqCst);
        *state = TransactionState::Prepared;
        Ok(lsn)
    }

    /// Write the COMMIT record and move to Committed. The log manager
    /// forces the record durable when sync-commit is configured; only
    /// after that does the caller release this transaction's locks.
    pub fn commit(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        if !matches!(*state, TransactionState::Active | TransactionState::Prepared) {
            return Err(TransactionError::InvalidState(self.id));
        }

        let lsn = self
            .log_manager
            .append_log_record(
                self.id,
                self.last_lsn.load(Ordering::SeqCst),
                LogRecordType::Commit,
                LogRecordContent::Transaction(TransactionOperationContent {
                    timestamp: wall_clock_secs(),
                    metadata: None,
                }),
            )
            .map_err(|e| TransactionError::LogError(e.to_string()))?;

        self.last_lsn.store(lsn, Ordering::SeqCst);
        *state = TransactionState::Committed;
        Ok(lsn)
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn.load(Ordering::SeqCst)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_lsn(&self, lsn: Lsn) {
        self.last_lsn.store(lsn, Ordering::SeqCst);
    }

    /// Record that the engine acquired a lock for this transaction.
    /// Returns false when the resource was already tracked.
    pub fn track_lock(&self, resource: ResourceId) -> bool {
        self.held_locks.lock().insert(resource)
    }

    pub fn holds_lock(&self, resource: ResourceId) -> bool {
        self.held_locks.lock().contains(&resource)
    }

    pub fn locked_resources(&self) -> Vec<ResourceId> {
        self.held_locks.lock().iter().copied().collect()
    }

    pub(crate) fn untrack_lock(&self, resource: ResourceId) {
        self.held_locks.lock().remove(&resource);
    }

    /// Drain the undo list for rollback (newest entries last).
    pub(crate) fn take_undo_log(&self) -> Vec<UndoEntry> {
        std::mem::take(&mut *self.undo_log.lock())
    }

    fn require_active(&self) -> Result<()> {
        if self.state() != TransactionState::Active {
            return Err(TransactionError::InvalidState(self.id));
        }
        Ok(())
    }

    fn append_key_record(
        &self,
        record_type: LogRecordType,
        index_id: u32,
        page_id: PageId,
        key: Vec<u8>,
        before_image: Option<Vec<u8>>,
        after_image: Option<Vec<u8>>,
    ) -> Result<Lsn> {
        let lsn = self
            .log_manager
            .append_log_record(
                self.id,
                self.last_lsn.load(Ordering::SeqCst),
                record_type,
                LogRecordContent::Key(KeyOperationContent {
                    index_id,
                    page_id,
                    key,
                    before_image,
                    after_image,
                }),
            )
            .map_err(|e| TransactionError::LogError(e.to_string()))?;

        self.last_lsn.store(lsn, Ordering::SeqCst);
        Ok(lsn)
    }
}
