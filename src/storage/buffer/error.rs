use thiserror::Error;
use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Page {0} not found in buffer pool")]
    PageNotFound(PageId),
    #[error("Buffer pool exhausted: all frames are pinned")]
    PoolExhausted,
    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Write-ahead log flush failed before page write: {0}")]
    WalFlushFailed(String),
}
