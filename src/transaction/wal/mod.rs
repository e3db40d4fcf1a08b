pub mod checkpoint;
pub mod log_buffer;
pub mod log_manager;
pub mod log_record;
pub mod recovery;

// Re-export the core items
pub use checkpoint::{CheckpointConfig, CheckpointManager};
pub use log_manager::{LogManager, LogManagerConfig, LogManagerError, LogRecordIterator};
pub use recovery::{RecoveryManager, RecoveryReport};
