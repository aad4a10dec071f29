//! Crash simulation.
//!
//! Two halves of a crash are simulated separately:
//!
//! 1. **The log tail**: [`CrashableBackend`] stops accepting bytes after a
//!    budget, leaving a partial frame behind like a process killed
//!    mid-write. [`LogTail`] hands the surviving bytes to a new log.
//! 2. **The page store**: [`CrashImage`] captures pages at one moment and
//!    overlays a chosen subset of later pages, giving any flush ordering
//!    the buffer cache could have produced. [`log_prefix`] cuts the log at
//!    a chosen record.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pagelog_testkit::crash::CrashImage;
//!
//! let before = CrashImage::capture(&pages);
//! // ... operations
//! let image = before.overlay(&pages, &[2, 5]).into_store()?;
//! ```

use pagelog_core::log::ForwardScan;
use pagelog_core::{CoreResult, LogManager, LogSource, Lsn, PageNo};
use pagelog_storage::{
    InMemoryBackend, MemoryPageStore, StorageBackend, StorageError, StorageResult,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

fn simulated(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("simulated crash during {what}"),
    ))
}

/// A log backend that fails once a byte budget is used up.
///
/// The write that crosses the budget lands partially, up to the budget.
pub struct CrashableBackend {
    inner: Arc<Mutex<InMemoryBackend>>,
    crash_after_bytes: Arc<AtomicU64>,
    bytes_written: u64,
    crashed: Arc<AtomicBool>,
}

/// The bytes a [`CrashableBackend`] leaves behind.
#[derive(Clone)]
pub struct LogTail {
    inner: Arc<Mutex<InMemoryBackend>>,
    crash_after_bytes: Arc<AtomicU64>,
    crashed: Arc<AtomicBool>,
}

impl CrashableBackend {
    /// Creates an empty backend that never crashes until armed, and the
    /// handle that outlives it.
    pub fn pair() -> (Self, LogTail) {
        let inner = Arc::new(Mutex::new(InMemoryBackend::new()));
        let crash_after_bytes = Arc::new(AtomicU64::new(u64::MAX));
        let crashed = Arc::new(AtomicBool::new(false));
        let backend = Self {
            inner: Arc::clone(&inner),
            crash_after_bytes: Arc::clone(&crash_after_bytes),
            bytes_written: 0,
            crashed: Arc::clone(&crashed),
        };
        (
            backend,
            LogTail {
                inner,
                crash_after_bytes,
                crashed,
            },
        )
    }
}

impl LogTail {
    /// Arms the backend: it accepts `bytes` more bytes in total, counted
    /// from its creation.
    pub fn crash_after(&self, bytes: u64) {
        self.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Whether a write has failed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Copy of the bytes that reached the backend.
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().data()
    }

    /// A fresh backend holding the surviving bytes.
    pub fn survivor(&self) -> InMemoryBackend {
        InMemoryBackend::with_data(self.bytes())
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.lock().read_at(offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let budget = self.crash_after_bytes.load(Ordering::SeqCst);
        let current = self.bytes_written;
        if self.crashed.load(Ordering::SeqCst) || current >= budget {
            self.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("write"));
        }
        if current + bytes.len() as u64 > budget {
            self.crashed.store(true, Ordering::SeqCst);
            let partial = (budget - current) as usize;
            debug!(written = current, partial, "simulated crash mid-write");
            self.inner.lock().append(&bytes[..partial])?;
            self.bytes_written = budget;
            return Err(simulated("partial write"));
        }
        self.bytes_written += bytes.len() as u64;
        self.inner.lock().append(bytes)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(simulated("flush"));
        }
        self.inner.lock().flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.lock().size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.bytes_written = self.bytes_written.min(new_size);
        self.inner.lock().truncate(new_size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(simulated("sync"));
        }
        self.inner.lock().sync()
    }
}

/// Pages as they were on disk at some moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashImage {
    page_size: usize,
    pages: BTreeMap<u32, Vec<u8>>,
}

impl CrashImage {
    /// Captures every page of `store`.
    pub fn capture(store: &MemoryPageStore) -> Self {
        use pagelog_storage::PageStore;
        Self {
            page_size: store.page_size(),
            pages: store.snapshot(),
        }
    }

    /// Takes `pgnos` from `store`, as if only those pages were flushed
    /// since the capture.
    #[must_use]
    pub fn overlay(mut self, store: &MemoryPageStore, pgnos: &[PageNo]) -> Self {
        let newer = store.snapshot();
        for pgno in pgnos {
            match newer.get(pgno) {
                Some(page) => {
                    self.pages.insert(*pgno, page.clone());
                }
                None => {
                    self.pages.remove(pgno);
                }
            }
        }
        self
    }

    /// The captured pages.
    pub fn pages(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.pages
    }

    /// A page store holding the image.
    ///
    /// # Errors
    ///
    /// Returns an error if a captured page has the wrong size.
    pub fn into_store(self) -> StorageResult<MemoryPageStore> {
        MemoryPageStore::from_pages(self.page_size, self.pages)
    }
}

/// A new in-memory log holding the records of `log` up to and including
/// `end`, at the same LSNs.
///
/// # Errors
///
/// Returns an error if `log` cannot be read.
pub fn log_prefix(log: &dyn LogSource, end: Lsn, max_file_size: u64) -> CoreResult<LogManager> {
    let copy = LogManager::in_memory(max_file_size)?;
    if let Some(first) = log.first_lsn()? {
        for entry in ForwardScan::new(log, first).until(end) {
            let entry = entry?;
            let lsn = copy.append(&entry.record()?)?;
            debug_assert_eq!(lsn, entry.lsn);
        }
    }
    Ok(copy)
}

/// LSNs of every record in `log`, oldest first.
///
/// # Errors
///
/// Returns an error if `log` cannot be read.
pub fn record_lsns(log: &dyn LogSource) -> CoreResult<Vec<Lsn>> {
    let Some(first) = log.first_lsn()? else {
        return Ok(Vec::new());
    };
    ForwardScan::new(log, first)
        .map(|entry| entry.map(|e| e.lsn))
        .collect()
}
