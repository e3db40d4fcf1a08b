use thiserror::Error;
use serde::{Deserialize, Serialize};
use bincode::{deserialize, serialize};

use crate::common::types::{Lsn, PageId, TxnId};

/// Error type for log record operations
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("Failed to serialize log record: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize log record: {0}")]
    DeserializationError(String),
}

/// Result type for log record operations
pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Types of log records supported by the WAL system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    /// Marks the beginning of a transaction
    Begin,
    /// Marks the successful completion of a transaction
    Commit,
    /// Marks the abortion/rollback of a transaction
    Abort,
    /// Marks a transaction as prepared (two-phase commit)
    Prepare,
    /// Records an update of an existing key
    Update,
    /// Records an insert of a new key
    Insert,
    /// Records the deletion of a key
    Delete,
    /// Marks a checkpoint in the log
    Checkpoint,
    /// Compensation for an undone update
    CompensationUpdate,
    /// Compensation for an undone delete (the key was reinserted)
    CompensationInsert,
    /// Compensation for an undone insert (the key was removed)
    CompensationDelete,
}

impl LogRecordType {
    /// Whether the record describes a keyed data operation.
    pub fn is_data_operation(&self) -> bool {
        matches!(
            self,
            LogRecordType::Update
                | LogRecordType::Insert
                | LogRecordType::Delete
                | LogRecordType::CompensationUpdate
                | LogRecordType::CompensationInsert
                | LogRecordType::CompensationDelete
        )
    }

    /// Whether the record compensates an undone operation.
    pub fn is_compensation(&self) -> bool {
        matches!(
            self,
            LogRecordType::CompensationUpdate
                | LogRecordType::CompensationInsert
                | LogRecordType::CompensationDelete
        )
    }
}

/// Content of a keyed data operation record.
///
/// Images are serialized values: `before_image` is what undo restores,
/// `after_image` is what redo reapplies. The page id names the leaf that
/// covered the key when the operation ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyOperationContent {
    /// Index the operation targeted
    pub index_id: u32,
    /// Leaf page covering the key at operation time
    pub page_id: PageId,
    /// Serialized key
    pub key: Vec<u8>,
    /// Before-image of the value (UPDATE/DELETE)
    pub before_image: Option<Vec<u8>>,
    /// After-image of the value (INSERT/UPDATE)
    pub after_image: Option<Vec<u8>>,
}

/// Content of a transaction lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOperationContent {
    /// Timestamp when the operation occurred
    pub timestamp: u64,
    /// Additional metadata for the transaction operation
    pub metadata: Option<Vec<u8>>,
}

/// Content of a checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointContent {
    /// Timestamp when the checkpoint occurred
    pub timestamp: u64,
    /// Transactions active at checkpoint time
    pub active_transactions: Vec<TxnId>,
    /// Dirty pages at checkpoint time (page_id, recovery lsn)
    pub dirty_pages: Vec<(PageId, Lsn)>,
}

/// Union of all possible log record content types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecordContent {
    Key(KeyOperationContent),
    Transaction(TransactionOperationContent),
    Checkpoint(CheckpointContent),
}

/// Main log record structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log Sequence Number - unique identifier for this log record
    pub lsn: Lsn,
    /// Transaction that generated this log record
    pub txn_id: TxnId,
    /// LSN of the previous log record in this transaction
    pub prev_lsn: Lsn,
    /// Type of operation this log record represents
    pub record_type: LogRecordType,
    /// Content of the log record, depends on the record type
    pub content: LogRecordContent,
}

pub(crate) fn wall_clock_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl LogRecord {
    pub fn new(
        lsn: Lsn,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            content,
        }
    }

    fn new_lifecycle(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn, record_type: LogRecordType) -> Self {
        Self::new(
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            LogRecordContent::Transaction(TransactionOperationContent {
                timestamp: wall_clock_secs(),
                metadata: None,
            }),
        )
    }

    pub fn new_begin(lsn: Lsn, txn_id: TxnId) -> Self {
        Self::new_lifecycle(lsn, txn_id, 0, LogRecordType::Begin)
    }

    pub fn new_commit(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new_lifecycle(lsn, txn_id, prev_lsn, LogRecordType::Commit)
    }

    pub fn new_abort(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new_lifecycle(lsn, txn_id, prev_lsn, LogRecordType::Abort)
    }

    pub fn new_prepare(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new_lifecycle(lsn, txn_id, prev_lsn, LogRecordType::Prepare)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_update(
        lsn: Lsn,
        txn_id: TxnId,
        prev_lsn: Lsn,
        index_id: u32,
        page_id: PageId,
        key: Vec<u8>,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Self {
        Self::new(
            lsn,
            txn_id,
            prev_lsn,
            LogRecordType::Update,
            LogRecordContent::Key(KeyOperationContent {
                index_id,
                page_id,
                key,
                before_image: Some(before_image),
                after_image: Some(after_image),
            }),
        )
    }

    pub fn new_insert(
        lsn: Lsn,
        txn_id: TxnId,
        prev_lsn: Lsn,
        index_id: u32,
        page_id: PageId,
        key: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Self {
        Self::new(
            lsn,
            txn_id,
            prev_lsn,
            LogRecordType::Insert,
            LogRecordContent::Key(KeyOperationContent {
                index_id,
                page_id,
                key,
                before_image: None,
                after_image: Some(after_image),
            }),
        )
    }

    pub fn new_delete(
        lsn: Lsn,
        txn_id: TxnId,
        prev_lsn: Lsn,
        index_id: u32,
        page_id: PageId,
        key: Vec<u8>,
        before_image: Vec<u8>,
    ) -> Self {
        Self::new(
            lsn,
            txn_id,
            prev_lsn,
            LogRecordType::Delete,
            LogRecordContent::Key(KeyOperationContent {
                index_id,
                page_id,
                key,
                before_image: Some(before_image),
                after_image: None,
            }),
        )
    }

    pub fn new_checkpoint(
        lsn: Lsn,
        active_transactions: Vec<TxnId>,
        dirty_pages: Vec<(PageId, Lsn)>,
    ) -> Self {
        Self::new(
            lsn,
            0, // A checkpoint belongs to no transaction
            0,
            LogRecordType::Checkpoint,
            LogRecordContent::Checkpoint(CheckpointContent {
                timestamp: wall_clock_secs(),
                active_transactions,
                dirty_pages,
            }),
        )
    }

    /// Serialize the log record to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self).map_err(|e| LogRecordError::SerializationError(e.to_string()))
    }

    /// Deserialize bytes into a log record
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        deserialize(data).map_err(|e| LogRecordError::DeserializationError(e.to_string()))
    }
}
