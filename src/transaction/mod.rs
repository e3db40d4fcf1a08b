pub mod concurrency;
pub mod wal;

// Public exports
pub use concurrency::lock_manager::{LockError, LockManager, LockMode};
pub use concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};
pub use concurrency::transaction_manager::TransactionManager;
pub use wal::log_manager::{LogManager, LogManagerConfig};
pub use wal::log_record::{LogRecord, LogRecordType};
