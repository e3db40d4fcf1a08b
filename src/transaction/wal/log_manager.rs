use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, PageId, TxnId};
use crate::transaction::wal::log_buffer::{AppendOutcome, LogBuffer, LogBufferConfig, LogBufferError};
use crate::transaction::wal::log_record::{LogRecord, LogRecordContent, LogRecordError, LogRecordType};

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Buffer error: {0}")]
    BufferError(#[from] LogBufferError),

    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Invalid log file format")]
    InvalidFormat,

    #[error("Corrupt log record (checksum mismatch or torn write)")]
    CorruptRecord,

    #[error("Invalid log state: {0}")]
    InvalidState(String),
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Size of the per-record frame header: length (u32) + crc32 (u32).
const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single framed record; larger lengths mean a torn or
/// garbage frame.
const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Log file header structure
#[derive(Debug, Clone)]
struct LogFileHeader {
    magic: u32,
    version: u32,
    header_size: u32,
    first_lsn: Lsn,
}

impl LogFileHeader {
    /// Magic number for log files: "GWAL" in ASCII
    const MAGIC: u32 = 0x4757414C;
    const VERSION: u32 = 1;
    const HEADER_SIZE: u32 = 20;

    fn new(first_lsn: Lsn) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            header_size: Self::HEADER_SIZE,
            first_lsn,
        }
    }

    fn write_to(&self, file: &mut File) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.magic.to_le_bytes())?;
        file.write_all(&self.version.to_le_bytes())?;
        file.write_all(&self.header_size.to_le_bytes())?;
        file.write_all(&self.first_lsn.to_le_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn read_from(file: &mut File) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;

        let mut word = [0u8; 4];
        file.read_exact(&mut word)?;
        let magic = u32::from_le_bytes(word);

        file.read_exact(&mut word)?;
        let version = u32::from_le_bytes(word);

        file.read_exact(&mut word)?;
        let header_size = u32::from_le_bytes(word);

        let mut long_word = [0u8; 8];
        file.read_exact(&mut long_word)?;
        let first_lsn = u64::from_le_bytes(long_word);

        Ok(Self {
            magic,
            version,
            header_size,
            first_lsn,
        })
    }

    fn validate(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }
}

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Path to the log directory
    pub log_dir: PathBuf,

    /// Base name for log files
    pub log_file_base_name: String,

    /// Maximum size of a log file before rotation
    pub max_log_file_size: u64,

    /// Log buffer configuration
    pub buffer_config: LogBufferConfig,

    /// Whether to force sync on every commit/abort/prepare
    pub force_sync: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file_base_name: "granitedb_log".to_string(),
            max_log_file_size: 100 * 1024 * 1024, // 100 MB
            buffer_config: LogBufferConfig::default(),
            force_sync: true,
        }
    }
}

/// Manager for write-ahead logging operations.
///
/// Records are framed on disk as `[len: u32][crc32: u32][body]`; the CRC
/// covers the body and is validated whenever the log is read back. The
/// append path stages frames in a double-buffered [`LogBuffer`] and
/// forces commit-class records durable when `force_sync` is set.
pub struct LogManager {
    config: LogManagerConfig,
    current_log_file: Mutex<File>,
    current_log_path: Mutex<PathBuf>,
    /// Next LSN to assign
    current_lsn: AtomicU64,
    /// Highest LSN known durable
    flushed_lsn: AtomicU64,
    /// LSN of the most recent checkpoint record
    last_checkpoint_lsn: AtomicU64,
    log_buffer: LogBuffer,
}

impl LogManager {
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;

        let (log_file, log_path, next_lsn) = Self::initialize_log_file(&config)?;
        let log_buffer = LogBuffer::new(config.buffer_config.clone());

        Ok(Self {
            config,
            current_log_file: Mutex::new(log_file),
            current_log_path: Mutex::new(log_path),
            current_lsn: AtomicU64::new(next_lsn),
            flushed_lsn: AtomicU64::new(next_lsn.saturating_sub(1)),
            last_checkpoint_lsn: AtomicU64::new(0),
            log_buffer,
        })
    }

    /// Open the newest log file, or create the first one.
    fn initialize_log_file(config: &LogManagerConfig) -> Result<(File, PathBuf, Lsn)> {
        let mut log_files = Self::find_log_files(config)?;

        if log_files.is_empty() {
            let path = Self::log_file_path(config, 1);
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;

            let header = LogFileHeader::new(1);
            header.write_to(&mut file)?;

            return Ok((file, path, 1));
        }

        log_files.sort_by_key(|(sequence, _)| *sequence);
        let (sequence, path) = log_files.pop().expect("non-empty list");

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = LogFileHeader::read_from(&mut file)?;
        if !header.validate() {
            return Err(LogManagerError::InvalidFormat);
        }

        let (max_lsn, valid_end) = Self::scan_valid_prefix(&mut file, header.header_size as u64)?;
        let next_lsn = max_lsn.max(header.first_lsn.saturating_sub(1)) + 1;

        // A torn tail would make later appends unreachable behind the
        // garbage; cut the file back to the end of the valid prefix.
        let file_size = file.metadata()?.len();
        if valid_end < file_size {
            warn!(
                "truncating {} bytes of torn log tail in {:?}",
                file_size - valid_end,
                path
            );
            file.set_len(valid_end)?;
        }
        let file_size = valid_end;

        if file_size >= config.max_log_file_size {
            let new_path = Self::log_file_path(config, sequence + 1);
            let mut new_file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&new_path)?;

            let new_header = LogFileHeader::new(next_lsn);
            new_header.write_to(&mut new_file)?;

            Ok((new_file, new_path, next_lsn))
        } else {
            file.seek(SeekFrom::End(0))?;
            Ok((file, path, next_lsn))
        }
    }

    /// Scan the frames of a log file and report the highest LSN in the
    /// valid prefix along with the byte offset where that prefix ends.
    /// A bad frame ends the scan: everything behind it is treated as
    /// torn.
    fn scan_valid_prefix(file: &mut File, start_position: u64) -> Result<(Lsn, u64)> {
        let mut max_lsn = 0;
        let mut valid_end = start_position;
        file.seek(SeekFrom::Start(start_position))?;

        loop {
            match read_frame(file) {
                Ok(Some(record)) => {
                    if record.lsn > max_lsn {
                        max_lsn = record.lsn;
                    }
                    valid_end = file.stream_position()?;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("torn or corrupt frame at log tail, truncating scan");
                    break;
                }
            }
        }

        Ok((max_lsn, valid_end))
    }

    /// Find all existing log files in the log directory.
    fn find_log_files(config: &LogManagerConfig) -> Result<Vec<(u32, PathBuf)>> {
        let mut result = Vec::new();

        if !config.log_dir.exists() {
            return Ok(result);
        }

        let prefix = format!("{}_", config.log_file_base_name);
        for entry in std::fs::read_dir(&config.log_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if let Ok(sequence) = suffix.parse::<u32>() {
                    result.push((sequence, path));
                }
            }
        }

        Ok(result)
    }

    fn log_file_path(config: &LogManagerConfig, sequence: u32) -> PathBuf {
        config
            .log_dir
            .join(format!("{}_{}", config.log_file_base_name, sequence))
    }

    /// Append a log record, returning its LSN. Commit-class records are
    /// forced durable before returning when `force_sync` is configured.
    pub fn append_log_record(
        &self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Result<Lsn> {
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord::new(lsn, txn_id, prev_lsn, record_type, content);
        let frame = frame_record(&record)?;

        match self.log_buffer.append(&frame, lsn)? {
            AppendOutcome::Buffered => {}
            AppendOutcome::ThresholdReached => {
                self.flush()?;
            }
            AppendOutcome::Full => {
                self.flush()?;
                match self.log_buffer.append(&frame, lsn)? {
                    AppendOutcome::Full => {
                        return Err(LogManagerError::InvalidState(
                            "log buffer full after flush".to_string(),
                        ))
                    }
                    _ => {}
                }
            }
        }

        let durable_now = self.config.force_sync
            && matches!(
                record_type,
                LogRecordType::Commit | LogRecordType::Abort | LogRecordType::Prepare
            );
        if durable_now {
            self.flush()?;
        }

        Ok(lsn)
    }

    /// Drain the log buffer to the current log file.
    pub fn flush(&self) -> Result<Lsn> {
        let force_sync = self.config.force_sync;
        let flushed = self.log_buffer.flush(|data| {
            let mut file = self.current_log_file.lock();

            let current_size = file.metadata()?.len();
            if current_size + data.len() as u64 > self.config.max_log_file_size {
                self.rotate_log_file(&mut file)?;
            }

            file.write_all(data)?;
            if force_sync {
                file.sync_data()?;
            }
            Ok(())
        })?;

        if flushed > 0 {
            self.flushed_lsn.fetch_max(flushed, Ordering::SeqCst);
        }
        Ok(flushed)
    }

    /// Rotate to a new log file.
    fn rotate_log_file(&self, file: &mut File) -> io::Result<()> {
        let current_path = self.current_log_path.lock().clone();

        let prefix = format!("{}_", self.config.log_file_base_name);
        let sequence = current_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "invalid log file name"))?;

        let new_path = Self::log_file_path(&self.config, sequence + 1);
        let mut new_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&new_path)?;

        let header = LogFileHeader::new(self.current_lsn.load(Ordering::SeqCst));
        header.write_to(&mut new_file)?;
        new_file.seek(SeekFrom::End(0))?;

        debug!("rotated log to {:?}", new_path);
        *self.current_log_path.lock() = new_path;
        *file = new_file;

        Ok(())
    }

    /// Current (next-to-assign) LSN.
    pub fn current_lsn(&self) -> Lsn {
        self.current_lsn.load(Ordering::SeqCst)
    }

    /// Highest LSN known durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// LSN of the most recent checkpoint written through this manager.
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn.load(Ordering::SeqCst)
    }

    /// Write a checkpoint record and force it durable.
    pub fn checkpoint(
        &self,
        active_txns: &[TxnId],
        dirty_pages: &[(PageId, Lsn)],
    ) -> Result<Lsn> {
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord::new_checkpoint(lsn, active_txns.to_vec(), dirty_pages.to_vec());
        let frame = frame_record(&record)?;

        if self.log_buffer.append(&frame, lsn)? == AppendOutcome::Full {
            self.flush()?;
            self.log_buffer.append(&frame, lsn)?;
        }
        self.flush()?;

        self.last_checkpoint_lsn.store(lsn, Ordering::SeqCst);
        Ok(lsn)
    }

    /// Iterate records with `lsn >= start_lsn` in LSN order across all
    /// log files. Frames fail CRC validation with
    /// [`LogManagerError::CorruptRecord`], after which iteration stops:
    /// replay is truncated at the first bad record.
    pub fn iter_from(&self, start_lsn: Lsn) -> Result<LogRecordIterator> {
        // Everything staged must be on disk before a scan sees it.
        self.flush()?;

        let mut files = Self::find_log_files(&self.config)?;
        files.sort_by_key(|(sequence, _)| *sequence);

        Ok(LogRecordIterator {
            files: files.into_iter().map(|(_, path)| path).collect(),
            next_file: 0,
            current: None,
            start_lsn,
            done: false,
        })
    }
}

/// Frame a record as `[len][crc32][body]`.
fn frame_record(record: &LogRecord) -> Result<Vec<u8>> {
    let body = record.serialize()?;
    let crc = crc32fast::hash(&body);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame. `Ok(None)` is a clean end of file; any short read,
/// oversized length, CRC mismatch, or undecodable body is `CorruptRecord`.
fn read_frame(file: &mut File) -> Result<Option<LogRecord>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")) as usize;
    let crc = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));

    if len == 0 || len > MAX_RECORD_SIZE {
        return Err(LogManagerError::CorruptRecord);
    }

    let mut body = vec![0u8; len];
    if file.read_exact(&mut body).is_err() {
        return Err(LogManagerError::CorruptRecord);
    }

    if crc32fast::hash(&body) != crc {
        return Err(LogManagerError::CorruptRecord);
    }

    LogRecord::deserialize(&body).map(Some).map_err(|_| LogManagerError::CorruptRecord)
}

/// Forward iterator over framed log records.
pub struct LogRecordIterator {
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<File>,
    start_lsn: Lsn,
    done: bool,
}

impl Iterator for LogRecordIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if self.current.is_none() {
                if self.next_file >= self.files.len() {
                    self.done = true;
                    return None;
                }
                let path = &self.files[self.next_file];
                self.next_file += 1;

                let mut file = match OpenOptions::new().read(true).open(path) {
                    Ok(f) => f,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                };
                let header = match LogFileHeader::read_from(&mut file) {
                    Ok(h) => h,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                };
                if !header.validate() {
                    self.done = true;
                    return Some(Err(LogManagerError::InvalidFormat));
                }
                if let Err(e) = file.seek(SeekFrom::Start(header.header_size as u64)) {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                self.current = Some(file);
            }

            let file = self.current.as_mut().expect("file is open");
            match read_frame(file) {
                Ok(Some(record)) => {
                    if record.lsn >= self.start_lsn {
                        return Some(Ok(record));
                    }
                    // Below the requested start point: keep scanning.
                }
                Ok(None) => {
                    // Clean end of this file, move to the next.
                    self.current = None;
                }
                Err(e) => {
                    // Replay truncates at the first bad frame.
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Open a path for appending raw bytes (test support for torn-write
/// scenarios).
pub fn append_raw_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}
