//! I/O ordering checks.
//!
//! A [`Journal`] records every append and sync made through the log
//! backends it hands out and every write and sync made through a wrapped
//! page store, in the order they happened. Tests then ask ordering
//! questions: which log files still hold unsynced bytes, or whether a page
//! ever reached the store ahead of the log records describing it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pagelog_testkit::journal::Journal;
//!
//! let journal = Journal::new();
//! let log = LogManager::open(Vec::new(), journal.factory(), max_file_size)?;
//! let pages = journal.pages(MemoryPageStore::new(512));
//! // ... operations
//! assert_eq!(journal.page_write_ahead_of_log(), None);
//! ```

use pagelog_core::log::BackendFactory;
use pagelog_storage::{
    InMemoryBackend, MemoryPageStore, PageStore, StorageBackend, StorageResult,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One I/O call seen by a [`Journal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Bytes appended to log file `file`.
    LogAppend {
        /// Log file number.
        file: u32,
    },
    /// Log file `file` synced.
    LogSync {
        /// Log file number.
        file: u32,
    },
    /// Page `pgno` written.
    PageWrite {
        /// Page number.
        pgno: u32,
    },
    /// Page store synced.
    PageSync,
}

/// Shared, ordered record of I/O calls.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<IoEvent>>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: IoEvent) {
        self.events.lock().push(event);
    }

    /// Every event so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<IoEvent> {
        self.events.lock().clone()
    }

    /// Number of syncs of log file `file`.
    #[must_use]
    pub fn syncs_of(&self, file: u32) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == IoEvent::LogSync { file })
            .count()
    }

    /// Log files appended to since their last sync.
    #[must_use]
    pub fn unsynced_files(&self) -> BTreeSet<u32> {
        unsynced_after(&self.events.lock())
    }

    /// The first page write made while some log file still held unsynced
    /// bytes, with its position in [`Journal::events`].
    #[must_use]
    pub fn page_write_ahead_of_log(&self) -> Option<(usize, IoEvent)> {
        let events = self.events.lock();
        events
            .iter()
            .enumerate()
            .find(|(i, event)| {
                matches!(event, IoEvent::PageWrite { .. })
                    && !unsynced_after(&events[..*i]).is_empty()
            })
            .map(|(i, event)| (i, *event))
    }

    /// An empty in-memory log backend for file `file` that reports here.
    #[must_use]
    pub fn backend(&self, file: u32) -> JournaledBackend {
        JournaledBackend {
            file,
            inner: InMemoryBackend::new(),
            journal: self.clone(),
        }
    }

    /// A log file factory handing out [`JournaledBackend`]s.
    #[must_use]
    pub fn factory(&self) -> BackendFactory {
        let journal = self.clone();
        Box::new(move |file| Ok(Box::new(journal.backend(file)) as Box<dyn StorageBackend>))
    }

    /// Wraps `pages` so its writes and syncs report here.
    #[must_use]
    pub fn pages(&self, pages: MemoryPageStore) -> JournaledPages {
        JournaledPages {
            inner: pages,
            journal: self.clone(),
        }
    }
}

fn unsynced_after(events: &[IoEvent]) -> BTreeSet<u32> {
    let mut unsynced = BTreeSet::new();
    for event in events {
        match *event {
            IoEvent::LogAppend { file } => {
                unsynced.insert(file);
            }
            IoEvent::LogSync { file } => {
                unsynced.remove(&file);
            }
            IoEvent::PageWrite { .. } | IoEvent::PageSync => {}
        }
    }
    unsynced
}

/// In-memory log file that reports appends and syncs to a [`Journal`].
pub struct JournaledBackend {
    file: u32,
    inner: InMemoryBackend,
    journal: Journal,
}

impl StorageBackend for JournaledBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.inner.append(data)?;
        self.journal.push(IoEvent::LogAppend { file: self.file });
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()?;
        self.journal.push(IoEvent::LogSync { file: self.file });
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Memory page store that reports writes and syncs to a [`Journal`].
pub struct JournaledPages {
    inner: MemoryPageStore,
    journal: Journal,
}

impl PageStore for JournaledPages {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read_page(&self, pgno: u32) -> StorageResult<Vec<u8>> {
        self.inner.read_page(pgno)
    }

    fn write_page(&self, pgno: u32, data: &[u8]) -> StorageResult<()> {
        self.inner.write_page(pgno, data)?;
        self.journal.push(IoEvent::PageWrite { pgno });
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u32> {
        self.inner.page_count()
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()?;
        self.journal.push(IoEvent::PageSync);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_write_before_log_sync_is_found() {
        let journal = Journal::new();
        let mut log = journal.backend(1);
        let pages = journal.pages(MemoryPageStore::new(512));
        log.append(b"abc").unwrap();
        log.sync().unwrap();
        pages.write_page(1, &[0u8; 512]).unwrap();
        assert_eq!(journal.page_write_ahead_of_log(), None);

        log.append(b"def").unwrap();
        pages.write_page(2, &[0u8; 512]).unwrap();
        assert_eq!(
            journal.page_write_ahead_of_log(),
            Some((4, IoEvent::PageWrite { pgno: 2 }))
        );
        assert_eq!(journal.unsynced_files(), BTreeSet::from([1]));
        assert_eq!(journal.syncs_of(1), 1);
    }
}
