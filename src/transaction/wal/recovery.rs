use std::collections::HashMap;
use std::sync::Arc;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::common::types::{Lsn, TxnId, Value};
use crate::index::btree::{BTreeError, BTreeIndex};
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::{
    KeyOperationContent, LogRecord, LogRecordContent, LogRecordType,
};

/// Error type for recovery operations
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),

    #[error("Index error during replay: {0}")]
    IndexError(String),

    #[error("Failed to recover: {0}")]
    RecoveryError(String),
}

impl From<BTreeError> for RecoveryError {
    fn from(e: BTreeError) -> Self {
        RecoveryError::IndexError(e.to_string())
    }
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Status of a transaction reconstructed from the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Committed,
    Aborted,
    /// No commit or abort record was found (includes prepared
    /// transactions, which are presumed aborted)
    InProgress,
}

/// Information about a transaction found during the analysis phase
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub txn_id: TxnId,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub status: TransactionStatus,
}

/// Summary of a completed recovery run
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Transactions observed in the log
    pub transactions_seen: usize,
    /// Data operations reapplied in the redo phase
    pub operations_redone: usize,
    /// Transactions rolled back in the undo phase
    pub transactions_rolled_back: usize,
    /// Replay stopped early at a corrupt or torn record
    pub truncated: bool,
}

/// Crash recovery driver: analysis, redo, undo.
///
/// Redo reapplies the after-images of committed transactions (plus the
/// compensation records of aborted ones) in LSN order, skipping
/// everything at or before the last checkpoint, whose page flush already
/// made those effects durable. Undo walks the unresolved transactions'
/// operations backwards, restoring before-images and writing
/// compensation and abort records.
pub struct RecoveryManager {
    log_manager: Arc<LogManager>,
    transaction_table: HashMap<TxnId, TransactionInfo>,
    operations: Vec<LogRecord>,
    checkpoint_lsn: Lsn,
}

impl RecoveryManager {
    pub fn new(log_manager: Arc<LogManager>) -> Self {
        Self {
            log_manager,
            transaction_table: HashMap::new(),
            operations: Vec::new(),
            checkpoint_lsn: 0,
        }
    }

    /// Run the full recovery pass, replaying into the given index.
    pub fn recover<K>(&mut self, index: &BTreeIndex<K>) -> Result<RecoveryReport>
    where
        K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        info!("starting crash recovery");
        let mut report = RecoveryReport::default();

        self.analysis_phase(&mut report)?;
        self.redo_phase(index, &mut report)?;
        self.undo_phase(index, &mut report)?;

        info!(
            "recovery complete: {} transactions, {} redone, {} rolled back{}",
            report.transactions_seen,
            report.operations_redone,
            report.transactions_rolled_back,
            if report.truncated {
                " (log truncated at a torn record)"
            } else {
                ""
            }
        );
        Ok(report)
    }

    /// Scan the log, building the transaction table and collecting data
    /// operations. A corrupt record truncates the scan: the valid prefix
    /// is all that recovery will see.
    fn analysis_phase(&mut self, report: &mut RecoveryReport) -> Result<()> {
        self.transaction_table.clear();
        self.operations.clear();
        self.checkpoint_lsn = 0;

        for record_result in self.log_manager.iter_from(0)? {
            let record = match record_result {
                Ok(record) => record,
                Err(LogManagerError::CorruptRecord) => {
                    warn!("corrupt log record: truncating replay here");
                    report.truncated = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            match record.record_type {
                LogRecordType::Begin => {
                    self.transaction_table.insert(
                        record.txn_id,
                        TransactionInfo {
                            txn_id: record.txn_id,
                            first_lsn: record.lsn,
                            last_lsn: record.lsn,
                            status: TransactionStatus::InProgress,
                        },
                    );
                }
                LogRecordType::Commit => {
                    if let Some(info) = self.transaction_table.get_mut(&record.txn_id) {
                        info.last_lsn = record.lsn;
                        info.status = TransactionStatus::Committed;
                    }
                }
                LogRecordType::Abort => {
                    if let Some(info) = self.transaction_table.get_mut(&record.txn_id) {
                        info.last_lsn = record.lsn;
                        info.status = TransactionStatus::Aborted;
                    }
                }
                LogRecordType::Prepare => {
                    // Prepared but unresolved transactions are presumed
                    // aborted and undone below.
                    if let Some(info) = self.transaction_table.get_mut(&record.txn_id) {
                        info.last_lsn = record.lsn;
                    }
                }
                LogRecordType::Checkpoint => {
                    self.checkpoint_lsn = record.lsn;
                }
                t if t.is_data_operation() => {
                    if let Some(info) = self.transaction_table.get_mut(&record.txn_id) {
                        info.last_lsn = record.lsn;
                    }
                    self.operations.push(record);
                }
                _ => {}
            }
        }

        // Appends from concurrent transactions can land in the buffer
        // slightly out of LSN order; replay must not.
        self.operations.sort_by_key(|r| r.lsn);

        report.transactions_seen = self.transaction_table.len();
        debug!(
            "analysis: {} transactions, {} data operations, checkpoint at {}",
            self.transaction_table.len(),
            self.operations.len(),
            self.checkpoint_lsn
        );
        Ok(())
    }

    /// Reapply the effects of resolved transactions in LSN order.
    fn redo_phase<K>(&self, index: &BTreeIndex<K>, report: &mut RecoveryReport) -> Result<()>
    where
        K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        for record in &self.operations {
            if record.lsn <= self.checkpoint_lsn {
                continue;
            }

            let status = match self.transaction_table.get(&record.txn_id) {
                Some(info) => info.status,
                None => continue,
            };

            let redo = match status {
                TransactionStatus::Committed => !record.record_type.is_compensation(),
                // An aborted transaction's own operations were reverted
                // before its abort record; only its compensations count.
                TransactionStatus::Aborted => record.record_type.is_compensation(),
                TransactionStatus::InProgress => false,
            };
            if !redo {
                continue;
            }

            let content = match &record.content {
                LogRecordContent::Key(content) => content,
                _ => continue,
            };

            debug!(
                "redo {:?} at LSN {} for transaction {}",
                record.record_type, record.lsn, record.txn_id
            );
            apply_forward(index, record.record_type, content)?;
            report.operations_redone += 1;
        }

        Ok(())
    }

    /// Roll back every unresolved transaction, newest first.
    fn undo_phase<K>(&self, index: &BTreeIndex<K>, report: &mut RecoveryReport) -> Result<()>
    where
        K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut losers: Vec<&TransactionInfo> = self
            .transaction_table
            .values()
            .filter(|info| info.status == TransactionStatus::InProgress)
            .collect();
        if losers.is_empty() {
            return Ok(());
        }
        losers.sort_by(|a, b| b.last_lsn.cmp(&a.last_lsn));

        info!("undo phase: rolling back {} transactions", losers.len());

        for info in losers {
            let mut ops: Vec<&LogRecord> = self
                .operations
                .iter()
                .filter(|r| {
                    r.txn_id == info.txn_id
                        && matches!(
                            r.record_type,
                            LogRecordType::Update | LogRecordType::Insert | LogRecordType::Delete
                        )
                })
                .collect();
            ops.sort_by(|a, b| b.lsn.cmp(&a.lsn));

            let mut prev_lsn = info.last_lsn;
            for record in ops {
                let content = match &record.content {
                    LogRecordContent::Key(content) => content,
                    _ => continue,
                };

                debug!(
                    "undo {:?} at LSN {} for transaction {}",
                    record.record_type, record.lsn, record.txn_id
                );
                let (clr_type, clr_after) =
                    apply_backward(index, record.record_type, content)?;

                prev_lsn = self.log_manager.append_log_record(
                    info.txn_id,
                    prev_lsn,
                    clr_type,
                    LogRecordContent::Key(KeyOperationContent {
                        index_id: content.index_id,
                        page_id: content.page_id,
                        key: content.key.clone(),
                        before_image: None,
                        after_image: clr_after,
                    }),
                )?;
            }

            self.log_manager.append_log_record(
                info.txn_id,
                prev_lsn,
                LogRecordType::Abort,
                LogRecordContent::Transaction(
                    crate::transaction::wal::log_record::TransactionOperationContent {
                        timestamp: crate::transaction::wal::log_record::wall_clock_secs(),
                        metadata: None,
                    },
                ),
            )?;

            report.transactions_rolled_back += 1;
        }

        self.log_manager.flush()?;
        Ok(())
    }
}

pub(crate) fn decode_key<K: DeserializeOwned>(bytes: &[u8]) -> Result<K> {
    bincode::deserialize(bytes)
        .map_err(|e| RecoveryError::RecoveryError(format!("undecodable key image: {}", e)))
}

pub(crate) fn decode_value(bytes: &[u8]) -> Result<Value> {
    bincode::deserialize(bytes)
        .map_err(|e| RecoveryError::RecoveryError(format!("undecodable value image: {}", e)))
}

/// Reapply an operation's forward effect (redo).
fn apply_forward<K>(
    index: &BTreeIndex<K>,
    record_type: LogRecordType,
    content: &KeyOperationContent,
) -> Result<()>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = decode_key(&content.key)?;

    match record_type {
        LogRecordType::Insert
        | LogRecordType::Update
        | LogRecordType::CompensationInsert
        | LogRecordType::CompensationUpdate => {
            let image = content.after_image.as_ref().ok_or_else(|| {
                RecoveryError::RecoveryError("redo record without after-image".to_string())
            })?;
            index.insert(key, decode_value(image)?)?;
        }
        LogRecordType::Delete | LogRecordType::CompensationDelete => {
            match index.delete(&key) {
                Ok(_) | Err(BTreeError::KeyNotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        _ => {}
    }

    Ok(())
}

/// Apply an operation's inverse (undo). Returns the compensation record
/// type and after-image describing what the undo did.
fn apply_backward<K>(
    index: &BTreeIndex<K>,
    record_type: LogRecordType,
    content: &KeyOperationContent,
) -> Result<(LogRecordType, Option<Vec<u8>>)>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key: K = decode_key(&content.key)?;

    match record_type {
        LogRecordType::Insert => {
            // Undo an insert by deleting the key.
            match index.delete(&key) {
                Ok(_) | Err(BTreeError::KeyNotFound) => {}
                Err(e) => return Err(e.into()),
            }
            Ok((LogRecordType::CompensationDelete, None))
        }
        LogRecordType::Update => {
            let image = content.before_image.as_ref().ok_or_else(|| {
                RecoveryError::RecoveryError("undo update without before-image".to_string())
            })?;
            index.insert(key, decode_value(image)?)?;
            Ok((LogRecordType::CompensationUpdate, Some(image.clone())))
        }
        LogRecordType::Delete => {
            let image = content.before_image.as_ref().ok_or_else(|| {
                RecoveryError::RecoveryError("undo delete without before-image".to_string())
            })?;
            index.insert(key, decode_value(image)?)?;
            Ok((LogRecordType::CompensationInsert, Some(image.clone())))
        }
        other => Err(RecoveryError::RecoveryError(format!(
            "cannot undo record type {:?}",
            other
        ))),
    }
}
