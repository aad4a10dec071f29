//! Fixed-size page stores.
//!
//! A [`PageStore`] is the narrow view of the buffer cache that the durability
//! core needs: whole-page reads and writes by page number plus a durability
//! barrier. Pages that were never written read back as zeroes, which the core
//! interprets as an uninitialized page with LSN zero.

use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

/// Page-addressed storage.
pub trait PageStore: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Reads page `pgno`. Pages beyond the end read as zeroes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn read_page(&self, pgno: u32) -> StorageResult<Vec<u8>>;

    /// Writes page `pgno`, extending the store if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PageSizeMismatch`] if `data` is not exactly
    /// one page long, or an I/O error.
    fn write_page(&self, pgno: u32, data: &[u8]) -> StorageResult<()>;

    /// Number of pages physically present (highest written page + 1).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn page_count(&self) -> StorageResult<u32>;

    /// Makes every written page durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&self) -> StorageResult<()>;
}

fn check_len(pgno: u32, data: &[u8], page_size: usize) -> StorageResult<()> {
    if data.len() != page_size {
        return Err(StorageError::PageSizeMismatch {
            pgno,
            len: data.len(),
            page_size,
        });
    }
    Ok(())
}

/// Pages held in a map; used by tests and crash images.
#[derive(Debug)]
pub struct MemoryPageStore {
    page_size: usize,
    pages: RwLock<BTreeMap<u32, Vec<u8>>>,
}

impl MemoryPageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a store from an existing set of page images.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PageSizeMismatch`] if any image has the
    /// wrong length.
    pub fn from_pages(page_size: usize, pages: BTreeMap<u32, Vec<u8>>) -> StorageResult<Self> {
        for (pgno, data) in &pages {
            check_len(*pgno, data, page_size)?;
        }
        Ok(Self {
            page_size,
            pages: RwLock::new(pages),
        })
    }

    /// Copies out every written page.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u32, Vec<u8>> {
        self.pages.read().clone()
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, pgno: u32) -> StorageResult<Vec<u8>> {
        Ok(self
            .pages
            .read()
            .get(&pgno)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.page_size]))
    }

    fn write_page(&self, pgno: u32, data: &[u8]) -> StorageResult<()> {
        check_len(pgno, data, self.page_size)?;
        self.pages.write().insert(pgno, data.to_vec());
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u32> {
        Ok(self
            .pages
            .read()
            .keys()
            .next_back()
            .map_or(0, |last| last + 1))
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Pages stored contiguously in one file at `pgno * page_size`.
#[derive(Debug)]
pub struct FilePageStore {
    page_size: usize,
    file: Mutex<File>,
}

impl FilePageStore {
    /// Opens or creates the page file at `path`.
    ///
    /// A trailing partial page, left by a crash while the file was being
    /// extended, is cut off. Recovery rewrites that page from the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or truncated.
    pub fn open(path: &Path, page_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let whole = len - len % page_size as u64;
        if whole != len {
            warn!(
                path = %path.display(),
                len,
                kept = whole,
                "truncating partial page at end of page file"
            );
            file.set_len(whole)?;
            file.sync_all()?;
        }
        Ok(Self {
            page_size,
            file: Mutex::new(file),
        })
    }

    fn offset(&self, pgno: u32) -> u64 {
        u64::from(pgno) * self.page_size as u64
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, pgno: u32) -> StorageResult<Vec<u8>> {
        let mut page = vec![0u8; self.page_size];
        let offset = self.offset(pgno);
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset + self.page_size as u64 <= len {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut page)?;
        }
        Ok(page)
    }

    fn write_page(&self, pgno: u32, data: &[u8]) -> StorageResult<()> {
        check_len(pgno, data, self.page_size)?;
        let offset = self.offset(pgno);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u32> {
        let len = self.file.lock().metadata()?.len();
        u32::try_from(len / self.page_size as u64)
            .map_err(|_| StorageError::Corrupted(format!("page file too large: {len} bytes")))
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
