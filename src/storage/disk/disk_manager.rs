use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, PAGE_SIZE};

/// Page 0 holds the engine metadata header; data pages start at 1.
pub const META_PAGE_ID: PageId = 0;

const META_MAGIC: u32 = 0x47524e54; // "GRNT"
const META_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
    #[error("Bad metadata page (magic {0:#x})")]
    BadMetadata(u32),
}

/// Metadata stored in page 0 of the data file.
///
/// Layout (little-endian): magic u32, version u32, root_page_id u64,
/// next_page_id u64.
#[derive(Debug, Clone, Copy)]
struct Metadata {
    root_page_id: PageId,
    next_page_id: PageId,
}

impl Metadata {
    fn encode(&self, buf: &mut [u8; PAGE_SIZE]) {
        LittleEndian::write_u32(&mut buf[0..4], META_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], META_VERSION);
        LittleEndian::write_u64(&mut buf[8..16], self.root_page_id);
        LittleEndian::write_u64(&mut buf[16..24], self.next_page_id);
    }

    fn decode(buf: &[u8; PAGE_SIZE]) -> Result<Self, DiskManagerError> {
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != META_MAGIC {
            return Err(DiskManagerError::BadMetadata(magic));
        }
        Ok(Self {
            root_page_id: LittleEndian::read_u64(&buf[8..16]),
            next_page_id: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

/// DiskManager is responsible for handling the actual disk I/O operations
pub struct DiskManager {
    db_file: Mutex<File>,
    meta: Mutex<Metadata>,
}

impl DiskManager {
    /// Open (or create) the data file and load the metadata page.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let file_size = file.metadata()?.len();
        let meta = if file_size < PAGE_SIZE as u64 {
            // Fresh file: write an initial metadata page.
            let meta = Metadata {
                root_page_id: 0,
                next_page_id: 1,
            };
            let mut buf = [0u8; PAGE_SIZE];
            meta.encode(&mut buf);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
            file.flush()?;
            meta
        } else {
            let mut buf = [0u8; PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            Metadata::decode(&buf)?
        };

        Ok(Self {
            db_file: Mutex::new(file),
            meta: Mutex::new(meta),
        })
    }

    /// Read a page from disk. Reads past the end of the file yield a
    /// zeroed page (freshly allocated pages have no backing bytes yet).
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == META_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id * PAGE_SIZE as u64;
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();
            let file_size = file.metadata()?.len();

            if offset >= file_size {
                page.page_id = page_id;
                page.data = [0; PAGE_SIZE];
                return Ok(());
            }

            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk.
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == META_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = page.page_id * PAGE_SIZE as u64;

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a new page on disk and return its ID.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut meta = self.meta.lock();
        let new_page_id = meta.next_page_id;
        meta.next_page_id += 1;

        {
            let mut file = self.db_file.lock();
            file.seek(SeekFrom::Start(new_page_id * PAGE_SIZE as u64))?;
            let zeros = [0u8; PAGE_SIZE];
            file.write_all(&zeros)?;
            file.flush()?;
        }

        self.write_metadata(&meta)?;
        Ok(new_page_id)
    }

    /// Root page id of the primary index, 0 if the tree has not been created.
    pub fn root_page_id(&self) -> PageId {
        self.meta.lock().root_page_id
    }

    /// Persist a new root page id into the metadata page.
    pub fn set_root_page_id(&self, root: PageId) -> Result<(), DiskManagerError> {
        let mut meta = self.meta.lock();
        meta.root_page_id = root;
        self.write_metadata(&meta)
    }

    /// Force file contents to stable storage.
    pub fn sync(&self) -> Result<(), DiskManagerError> {
        self.db_file.lock().sync_data()?;
        Ok(())
    }

    fn write_metadata(&self, meta: &Metadata) -> Result<(), DiskManagerError> {
        let mut buf = [0u8; PAGE_SIZE];
        meta.encode(&mut buf);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }
}
