use std::io;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::Lsn;

/// Error type for log buffer operations
#[derive(Error, Debug)]
pub enum LogBufferError {
    #[error("Record of {0} bytes exceeds the log buffer capacity")]
    RecordTooLarge(usize),

    #[error("I/O error while draining buffer: {0}")]
    IoError(#[from] io::Error),
}

/// Result type for log buffer operations
pub type Result<T> = std::result::Result<T, LogBufferError>;

/// Configuration for log buffer behavior
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Size of each buffer segment in bytes
    pub buffer_size: usize,

    /// Fill ratio past which the caller should trigger a flush
    pub flush_threshold: f32,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024, // 1 MB
            flush_threshold: 0.75,
        }
    }
}

/// A segment of framed log records staged for one write.
#[derive(Debug)]
struct BufferSegment {
    data: Vec<u8>,
    pos: usize,
    max_lsn: Lsn,
}

impl BufferSegment {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            pos: 0,
            max_lsn: 0,
        }
    }

    fn has_space(&self, len: usize) -> bool {
        self.pos + len <= self.data.len()
    }

    fn append(&mut self, bytes: &[u8], lsn: Lsn) {
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        if lsn > self.max_lsn {
            self.max_lsn = lsn;
        }
    }

    fn content(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.max_lsn = 0;
    }

    fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

/// Double-buffered staging area for framed log records.
///
/// Appends land in the active segment; a flush swaps the segments and
/// drains the filled one while new appends continue into the other.
#[derive(Debug)]
pub struct LogBuffer {
    active: Mutex<BufferSegment>,
    draining: Mutex<BufferSegment>,
    config: LogBufferConfig,
}

/// Outcome of an append: whether the caller should flush soon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Buffered,
    ThresholdReached,
    Full,
}

impl LogBuffer {
    pub fn new(config: LogBufferConfig) -> Self {
        Self {
            active: Mutex::new(BufferSegment::new(config.buffer_size)),
            draining: Mutex::new(BufferSegment::new(config.buffer_size)),
            config,
        }
    }

    /// Stage a framed record. `Full` means the caller must flush and
    /// retry; a record larger than a whole segment is rejected.
    pub fn append(&self, bytes: &[u8], lsn: Lsn) -> Result<AppendOutcome> {
        if bytes.len() > self.config.buffer_size {
            return Err(LogBufferError::RecordTooLarge(bytes.len()));
        }

        let mut active = self.active.lock();
        if !active.has_space(bytes.len()) {
            return Ok(AppendOutcome::Full);
        }

        active.append(bytes, lsn);

        let threshold = (self.config.buffer_size as f32 * self.config.flush_threshold) as usize;
        if active.pos >= threshold {
            Ok(AppendOutcome::ThresholdReached)
        } else {
            Ok(AppendOutcome::Buffered)
        }
    }

    /// Drain staged records through the writer. Returns the highest LSN
    /// made durable by this call (0 when nothing was staged).
    pub fn flush<F>(&self, mut writer: F) -> Result<Lsn>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        // The draining lock serializes flushes; the active lock is held
        // only for the swap, so appends continue while the write runs.
        let mut draining = self.draining.lock();
        let mut flushed_lsn = 0;

        // A failed previous flush leaves bytes staged here; they must go
        // out before anything newer to keep the on-disk order.
        if !draining.is_empty() {
            writer(draining.content())?;
            flushed_lsn = draining.max_lsn;
            draining.reset();
        }

        {
            let mut active = self.active.lock();
            std::mem::swap(&mut *active, &mut *draining);
        }

        if !draining.is_empty() {
            writer(draining.content())?;
            flushed_lsn = flushed_lsn.max(draining.max_lsn);
            draining.reset();
        }

        Ok(flushed_lsn)
    }
}
