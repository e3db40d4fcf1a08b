use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{debug, info};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::TxnId;
use crate::index::btree::{BTreeError, BTreeIndex};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Result, Transaction, TransactionError, TransactionState,
};
use crate::transaction::wal::log_manager::LogManager;
use crate::transaction::wal::log_record::{
    KeyOperationContent, LogRecordContent, LogRecordType, TransactionOperationContent,
    wall_clock_secs,
};
use crate::transaction::wal::recovery::{decode_key, decode_value};

/// Creates and tracks transactions; drives commit, abort (with undo),
/// and the two-phase prepare path.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    log_manager: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(log_manager: Arc<LogManager>, lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            log_manager,
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction under the given isolation level.
    pub fn begin_transaction(&self, isolation_level: IsolationLevel) -> Result<TxnId> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(
            txn_id,
            self.log_manager.clone(),
            isolation_level,
        ));

        txn.begin()?;
        self.active_transactions.lock().insert(txn_id, txn);
        debug!("transaction {} began ({:?})", txn_id, isolation_level);
        Ok(txn_id)
    }

    /// Commit: the COMMIT record is made durable (per the log manager's
    /// sync policy) before any lock is released.
    pub fn commit_transaction(&self, txn_id: TxnId) -> Result<()> {
        let txn = self.take_transaction(txn_id)?;

        match txn.commit() {
            Ok(_) => {
                self.lock_manager.unlock_all(txn_id);
                debug!("transaction {} committed", txn_id);
                Ok(())
            }
            Err(e) => {
                // A commit whose log write failed cannot be durable; the
                // transaction dies with its locks released.
                txn.set_state(TransactionState::Aborted);
                self.lock_manager.unlock_all(txn_id);
                Err(e)
            }
        }
    }

    /// Two-phase commit prepare.
    pub fn prepare_transaction(&self, txn_id: TxnId) -> Result<()> {
        let txn = self.get_transaction(txn_id).ok_or_else(|| {
            TransactionError::InternalError(format!("Transaction {} not found", txn_id))
        })?;
        txn.prepare()?;
        Ok(())
    }

    /// Abort: replay the transaction's undo list in reverse, restoring
    /// before-images through the index and writing compensation records,
    /// then an ABORT record. Synchronous; locks release last.
    pub fn abort_transaction<K>(&self, txn_id: TxnId, index: &BTreeIndex<K>) -> Result<()>
    where
        K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let txn = self.take_transaction(txn_id)?;

        if !matches!(
            txn.state(),
            TransactionState::Active | TransactionState::Prepared
        ) {
            self.active_transactions.lock().insert(txn_id, txn);
            return Err(TransactionError::InvalidState(txn_id));
        }

        let undo_entries = txn.take_undo_log();
        let mut prev_lsn = txn.last_lsn();

        for entry in undo_entries.iter().rev() {
            let (clr_type, clr_after) = match entry.record_type {
                LogRecordType::Insert => {
                    let key: K = decode_key(&entry.key)
                        .map_err(|e| TransactionError::UndoError(e.to_string()))?;
                    match index.delete(&key) {
                        Ok(_) | Err(BTreeError::KeyNotFound) => {}
                        Err(e) => return Err(TransactionError::UndoError(e.to_string())),
                    }
                    (LogRecordType::CompensationDelete, None)
                }
                LogRecordType::Update | LogRecordType::Delete => {
                    let key: K = decode_key(&entry.key)
                        .map_err(|e| TransactionError::UndoError(e.to_string()))?;
                    let image = entry.before_image.as_ref().ok_or_else(|| {
                        TransactionError::UndoError("undo entry without before-image".to_string())
                    })?;
                    let value = decode_value(image)
                        .map_err(|e| TransactionError::UndoError(e.to_string()))?;
                    index
                        .insert(key, value)
                        .map_err(|e| TransactionError::UndoError(e.to_string()))?;

                    let clr_type = if entry.record_type == LogRecordType::Update {
                        LogRecordType::CompensationUpdate
                    } else {
                        LogRecordType::CompensationInsert
                    };
                    (clr_type, Some(image.clone()))
                }
                other => {
                    return Err(TransactionError::UndoError(format!(
                        "unexpected undo entry {:?}",
                        other
                    )))
                }
            };

            prev_lsn = self
                .log_manager
                .append_log_record(
                    txn_id,
                    prev_lsn,
                    clr_type,
                    LogRecordContent::Key(KeyOperationContent {
                        index_id: entry.index_id,
                        page_id: entry.page_id,
                        key: entry.key.clone(),
                        before_image: None,
                        after_image: clr_after,
                    }),
                )
                .map_err(|e| TransactionError::LogError(e.to_string()))?;
        }

        self.log_manager
            .append_log_record(
                txn_id,
                prev_lsn,
                LogRecordType::Abort,
                LogRecordContent::Transaction(TransactionOperationContent {
                    timestamp: wall_clock_secs(),
                    metadata: None,
                }),
            )
            .map_err(|e| TransactionError::LogError(e.to_string()))?;

        txn.set_state(TransactionState::Aborted);
        txn.set_last_lsn(prev_lsn);
        self.lock_manager.unlock_all(txn_id);
        info!(
            "transaction {} aborted ({} operations undone)",
            txn_id,
            undo_entries.len()
        );
        Ok(())
    }

    /// Look up an active transaction.
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn transaction_exists(&self, txn_id: TxnId) -> bool {
        self.active_transactions.lock().contains_key(&txn_id)
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    fn take_transaction(&self, txn_id: TxnId) -> Result<Arc<Transaction>> {
        self.active_transactions
            .lock()
            .remove(&txn_id)
            .ok_or_else(|| {
                TransactionError::InternalError(format!("Transaction {} not found", txn_id))
            })
    }
}
