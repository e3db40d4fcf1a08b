use std::sync::Arc;
use std::time::Instant;
use log::info;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, TxnId};
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};

/// Error type for checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(String),
}

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Configuration for checkpoint behavior
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Minimum time between automatic checkpoints in seconds
    pub checkpoint_interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 300, // 5 minutes
        }
    }
}

/// Creates checkpoints: flushes every dirty page, then writes a durable
/// checkpoint record so recovery can bound its replay.
pub struct CheckpointManager {
    log_manager: Arc<LogManager>,
    buffer_pool: Arc<BufferPoolManager>,
    config: CheckpointConfig,
    last_checkpoint_time: Mutex<Instant>,
}

impl CheckpointManager {
    pub fn new(
        log_manager: Arc<LogManager>,
        buffer_pool: Arc<BufferPoolManager>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            log_manager,
            buffer_pool,
            config,
            last_checkpoint_time: Mutex::new(Instant::now()),
        }
    }

    /// Flush all dirty pages and append a checkpoint record naming the
    /// transactions still active. After the flush the dirty page table is
    /// empty, which is what the record carries.
    pub fn create_checkpoint(&self, active_txns: &[TxnId]) -> Result<Lsn> {
        self.buffer_pool
            .flush_all_pages()
            .map_err(|e| CheckpointError::BufferPoolError(e.to_string()))?;

        let checkpoint_lsn = self.log_manager.checkpoint(active_txns, &[])?;
        *self.last_checkpoint_time.lock() = Instant::now();

        info!(
            "checkpoint at LSN {} ({} active transactions)",
            checkpoint_lsn,
            active_txns.len()
        );
        Ok(checkpoint_lsn)
    }

    /// Whether the configured interval has elapsed since the last
    /// checkpoint.
    pub fn checkpoint_needed(&self) -> bool {
        self.last_checkpoint_time.lock().elapsed().as_secs() >= self.config.checkpoint_interval
    }
}
