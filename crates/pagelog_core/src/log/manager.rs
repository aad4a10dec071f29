//! Log writer and positional reader over numbered log files.

use crate::error::{CoreError, CoreResult};
use crate::log::codec::{encode_frame, verify_frame, FrameHeader, FRAME_HEADER_SIZE};
use crate::log::record::{LogRecord, RecordBody, RecordKind};
use crate::types::Lsn;
use pagelog_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Creates the backend for log file `n`.
pub type BackendFactory = Box<dyn Fn(u32) -> CoreResult<Box<dyn StorageBackend>> + Send + Sync>;

/// One frame read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Where the frame starts.
    pub lsn: Lsn,
    /// Encoded record body.
    pub body: Vec<u8>,
    /// Preceding frame, if any.
    pub prev: Option<Lsn>,
    /// Following frame, if any.
    pub next: Option<Lsn>,
}

impl LogEntry {
    /// Decodes the body.
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed records.
    pub fn record(&self) -> CoreResult<LogRecord> {
        LogRecord::decode(&self.body)
    }
}

/// The log as recovery sees it: positional reads in both directions, plus
/// appends for the records recovery itself writes.
pub trait LogSource: Send + Sync {
    /// LSN of the oldest record, if the log is not empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the backends cannot be inspected.
    fn first_lsn(&self) -> CoreResult<Option<Lsn>>;

    /// LSN of the newest record, if the log is not empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the backends cannot be inspected.
    fn last_lsn(&self) -> CoreResult<Option<Lsn>>;

    /// Reads the frame starting at `lsn`. Returns `None` when no frame
    /// can start there (unknown file or past the end).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] or
    /// [`CoreError::ChecksumMismatch`] when the bytes at `lsn` are not a
    /// valid frame.
    fn read_at(&self, lsn: Lsn) -> CoreResult<Option<LogEntry>>;

    /// Appends a record and returns its LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&self, record: &LogRecord) -> CoreResult<Lsn>;

    /// Makes every appended record durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&self) -> CoreResult<()>;

    /// Makes every record up to and including `lsn` durable. Called before
    /// a page stamped with `lsn` is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync_to(&self, lsn: Lsn) -> CoreResult<()> {
        let _ = lsn;
        self.sync()
    }
}

struct LogFiles {
    files: BTreeMap<u32, Box<dyn StorageBackend>>,
    current: u32,
    last_frame_len: u32,
    last_lsn: Option<Lsn>,
    /// Files appended to since their last sync.
    dirty: BTreeSet<u32>,
    /// Newest record known to be durable.
    synced: Option<Lsn>,
}

impl LogFiles {
    fn flush_dirty(&mut self) -> CoreResult<()> {
        for n in &self.dirty {
            if let Some(backend) = self.files.get_mut(n) {
                backend.flush()?;
            }
        }
        Ok(())
    }

    /// Syncs every dirty file, oldest first. A file stays dirty until its
    /// own sync succeeds.
    fn sync_dirty(&mut self) -> CoreResult<()> {
        while let Some(n) = self.dirty.first().copied() {
            if let Some(backend) = self.files.get_mut(&n) {
                backend.flush()?;
                backend.sync()?;
            }
            self.dirty.remove(&n);
            debug!(file = n, "log file synced");
        }
        self.synced = self.last_lsn;
        Ok(())
    }

    fn size_of(&self, file: u32) -> CoreResult<u64> {
        match self.files.get(&file) {
            Some(backend) => Ok(backend.size()?),
            None => Ok(0),
        }
    }

    fn next_nonempty_after(&self, file: u32) -> CoreResult<Option<u32>> {
        for (&n, backend) in self.files.range(file + 1..) {
            if backend.size()? > 0 {
                return Ok(Some(n));
            }
        }
        Ok(None)
    }

    fn prev_nonempty_before(&self, file: u32) -> CoreResult<Option<u32>> {
        for (&n, backend) in self.files.range(..file).rev() {
            if backend.size()? > 0 {
                return Ok(Some(n));
            }
        }
        Ok(None)
    }
}

/// Last complete frame of a file and where valid data ends.
struct FileScan {
    last_frame: Option<(u32, u32)>,
    valid_end: u64,
}

/// Walks the frames of one file.
///
/// In the newest file (`tail`), a header that does not parse over bytes
/// that are all zero, or a checksum failure on the frame that ends the
/// file, marks where a crash interrupted the write; the scan stops there.
/// Anywhere else either is corruption.
fn scan_file(backend: &dyn StorageBackend, tail: bool) -> CoreResult<FileScan> {
    let size = backend.size()?;
    let mut offset = 0u64;
    let mut last_frame = None;
    while offset + FRAME_HEADER_SIZE as u64 <= size {
        let header = match FrameHeader::parse(&backend.read_at(offset, FRAME_HEADER_SIZE)?) {
            Ok(header) => header,
            Err(_) if tail && zero_filled(backend, offset, size)? => break,
            Err(e) => return Err(e),
        };
        let len = header.frame_len();
        if offset + len > size {
            break;
        }
        match verify_frame(&backend.read_at(offset, len as usize)?) {
            Ok(_) => {}
            Err(_) if tail && offset + len == size => break,
            Err(e) => return Err(e),
        }
        last_frame = Some((offset as u32, len as u32));
        offset += len;
    }
    Ok(FileScan {
        last_frame,
        valid_end: offset,
    })
}

fn zero_filled(backend: &dyn StorageBackend, from: u64, size: u64) -> CoreResult<bool> {
    let rest = backend.read_at(from, (size - from) as usize)?;
    Ok(rest.iter().all(|b| *b == 0))
}

/// Formats the name of log file `n`.
#[must_use]
pub fn log_file_name(n: u32) -> String {
    format!("log.{n:010}")
}

fn parse_log_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("log.")?;
    if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

/// Append-only log over numbered files.
///
/// LSNs are handed out under a single writer mutex, so they are strictly
/// increasing. A file is closed and the next one started when an append
/// would push it past `max_file_size`. Every file written since the last
/// sync is synced by the next one, so records left behind in a rotated-out
/// file are as durable as the marker that follows them.
///
/// On open, whatever follows the last intact frame of the newest file (a
/// short fragment, a zero-filled extension or a final frame whose checksum
/// fails) is cut off. Corruption anywhere else is reported.
pub struct LogManager {
    state: Mutex<LogFiles>,
    factory: BackendFactory,
    max_file_size: u64,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogManager")
            .field("files", &state.files.keys().collect::<Vec<_>>())
            .field("last_lsn", &state.last_lsn)
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

impl LogManager {
    /// Opens a log over existing files, numbered from 1.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend fails, or if a frame other than the
    /// newest file's last one is corrupt.
    pub fn open(
        files: Vec<(u32, Box<dyn StorageBackend>)>,
        factory: BackendFactory,
        max_file_size: u64,
    ) -> CoreResult<Self> {
        let mut files: BTreeMap<u32, Box<dyn StorageBackend>> = files.into_iter().collect();
        if files.contains_key(&0) {
            return Err(CoreError::invalid_operation("log files are numbered from 1"));
        }
        if files.is_empty() {
            files.insert(1, factory(1)?);
        }
        let current = files.keys().next_back().copied().unwrap_or(1);

        let mut last = None;
        let mut dirty = BTreeSet::new();
        for (&n, backend) in files.iter_mut().rev() {
            let scan = scan_file(backend.as_ref(), n == current)?;
            if n == current {
                let size = backend.size()?;
                if scan.valid_end < size {
                    warn!(
                        file = n,
                        valid_end = scan.valid_end,
                        size,
                        "truncating torn log tail"
                    );
                    backend.truncate(scan.valid_end)?;
                    dirty.insert(n);
                }
            }
            if let Some((offset, len)) = scan.last_frame {
                last = Some((Lsn::new(n, offset), len));
                break;
            }
        }

        debug!(files = files.len(), current, last_lsn = ?last.map(|l| l.0), "log opened");
        Ok(Self {
            state: Mutex::new(LogFiles {
                files,
                current,
                last_frame_len: last.map_or(0, |(_, len)| len),
                last_lsn: last.map(|(lsn, _)| lsn),
                dirty,
                synced: last.map(|(lsn, _)| lsn),
            }),
            factory,
            max_file_size,
        })
    }

    /// Opens a log whose files live only in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the first file cannot be created.
    pub fn in_memory(max_file_size: u64) -> CoreResult<Self> {
        Self::from_backends(Vec::new(), max_file_size)
    }

    /// Opens a log over the given backends, numbered from 1 in order. New
    /// files are created in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend fails or the log is corrupt.
    pub fn from_backends(
        backends: Vec<Box<dyn StorageBackend>>,
        max_file_size: u64,
    ) -> CoreResult<Self> {
        let files = backends
            .into_iter()
            .enumerate()
            .map(|(i, backend)| (i as u32 + 1, backend))
            .collect();
        Self::open(
            files,
            Box::new(|_| Ok(Box::new(InMemoryBackend::new()) as Box<dyn StorageBackend>)),
            max_file_size,
        )
    }

    /// Opens the `log.NNNNNNNNNN` files in `dir`, creating the first one if
    /// none exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file cannot be
    /// opened.
    pub fn open_dir(dir: &Path, max_file_size: u64) -> CoreResult<Self> {
        let mut files: Vec<(u32, Box<dyn StorageBackend>)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(n) = name.to_str().and_then(parse_log_file_name) {
                files.push((n, Box::new(FileBackend::open(&entry.path())?)));
            }
        }
        let dir: PathBuf = dir.to_path_buf();
        Self::open(
            files,
            Box::new(move |n| {
                Ok(Box::new(FileBackend::open(&dir.join(log_file_name(n)))?)
                    as Box<dyn StorageBackend>)
            }),
            max_file_size,
        )
    }

    fn place(&self, state: &mut LogFiles, frame_len: usize) -> CoreResult<Lsn> {
        let size = state.size_of(state.current)?;
        if size > 0 && size + frame_len as u64 > self.max_file_size {
            let next = state.current + 1;
            state.files.insert(next, (self.factory)(next)?);
            state.current = next;
            debug!(file = next, "log file rotated");
            return Ok(Lsn::new(next, 0));
        }
        let offset = u32::try_from(size)
            .map_err(|_| CoreError::invalid_operation("log file exceeds 4 GiB"))?;
        Ok(Lsn::new(state.current, offset))
    }

    fn write_body(&self, state: &mut LogFiles, lsn: Lsn, body: &[u8]) -> CoreResult<()> {
        let frame = encode_frame(body, state.last_frame_len)?;
        let backend = state
            .files
            .get_mut(&lsn.file)
            .ok_or_else(|| CoreError::log_corruption(format!("log file {} missing", lsn.file)))?;
        backend.append(&frame)?;
        state.dirty.insert(lsn.file);
        state.last_frame_len = frame.len() as u32;
        state.last_lsn = Some(lsn);
        Ok(())
    }

    fn check_writable(record: &LogRecord) -> CoreResult<()> {
        match (record.kind(), &record.body) {
            (Some(kind), _) if kind.is_legacy() => Err(CoreError::invalid_operation(format!(
                "{} records are read-only",
                kind.name()
            ))),
            (_, RecordBody::Other { kind, .. }) if RecordKind::from_code(*kind).is_some() => {
                Err(CoreError::invalid_operation(format!("record tag {kind} is reserved")))
            }
            _ => Ok(()),
        }
    }

    /// Appends a record whose contents depend on the LSN it will receive.
    ///
    /// `build` is called twice: once to size the frame and once with the
    /// final LSN. Both calls must encode to the same length.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the two encodings differ in
    /// length.
    pub fn append_with<F>(&self, build: F) -> CoreResult<Lsn>
    where
        F: Fn(Lsn) -> LogRecord,
    {
        let sized = build(Lsn::ZERO);
        Self::check_writable(&sized)?;
        let sized_len = sized.encode().len();

        let mut state = self.state.lock();
        let lsn = self.place(&mut state, sized_len + crate::log::codec::FRAME_OVERHEAD)?;
        let body = build(lsn).encode();
        if body.len() != sized_len {
            return Err(CoreError::invalid_operation(
                "record length depends on its own LSN",
            ));
        }
        self.write_body(&mut state, lsn, &body)?;
        Ok(lsn)
    }

    /// Pushes buffered writes to the OS without syncing.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.state.lock().flush_dirty()
    }

    /// Numbers of the files currently making up the log.
    #[must_use]
    pub fn file_numbers(&self) -> Vec<u32> {
        self.state.lock().files.keys().copied().collect()
    }
}

impl LogSource for LogManager {
    fn first_lsn(&self) -> CoreResult<Option<Lsn>> {
        let state = self.state.lock();
        Ok(state.next_nonempty_after(0)?.map(|n| Lsn::new(n, 0)))
    }

    fn last_lsn(&self) -> CoreResult<Option<Lsn>> {
        Ok(self.state.lock().last_lsn)
    }

    fn read_at(&self, lsn: Lsn) -> CoreResult<Option<LogEntry>> {
        let state = self.state.lock();
        let Some(backend) = state.files.get(&lsn.file) else {
            return Ok(None);
        };
        let size = backend.size()?;
        let offset = u64::from(lsn.offset);
        if offset + FRAME_HEADER_SIZE as u64 > size {
            return Ok(None);
        }
        let header = FrameHeader::parse(&backend.read_at(offset, FRAME_HEADER_SIZE)?)?;
        let len = header.frame_len();
        if offset + len > size {
            return Err(CoreError::log_corruption(format!(
                "frame at {lsn} runs past the end of its file"
            )));
        }
        let frame = backend.read_at(offset, len as usize)?;
        let body = verify_frame(&frame)?.to_vec();

        let next = if offset + len < size {
            Some(Lsn::new(lsn.file, (offset + len) as u32))
        } else {
            state.next_nonempty_after(lsn.file)?.map(|n| Lsn::new(n, 0))
        };

        let prev_len = header.prev_frame_len;
        let prev = if prev_len == 0 {
            None
        } else if lsn.offset > 0 {
            let prev_offset = lsn.offset.checked_sub(prev_len).ok_or_else(|| {
                CoreError::log_corruption(format!("frame at {lsn} has a bad back link"))
            })?;
            Some(Lsn::new(lsn.file, prev_offset))
        } else {
            match state.prev_nonempty_before(lsn.file)? {
                Some(n) => {
                    let prev_size = state.size_of(n)?;
                    let prev_offset = prev_size.checked_sub(u64::from(prev_len)).ok_or_else(|| {
                        CoreError::log_corruption(format!("frame at {lsn} has a bad back link"))
                    })?;
                    Some(Lsn::new(n, prev_offset as u32))
                }
                None => None,
            }
        };

        Ok(Some(LogEntry {
            lsn,
            body,
            prev,
            next,
        }))
    }

    fn append(&self, record: &LogRecord) -> CoreResult<Lsn> {
        Self::check_writable(record)?;
        let body = record.encode();
        let mut state = self.state.lock();
        let lsn = self.place(&mut state, body.len() + crate::log::codec::FRAME_OVERHEAD)?;
        self.write_body(&mut state, lsn, &body)?;
        Ok(lsn)
    }

    fn sync(&self) -> CoreResult<()> {
        self.state.lock().sync_dirty()
    }

    fn sync_to(&self, lsn: Lsn) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.synced.is_some_and(|synced| synced >= lsn) {
            return Ok(());
        }
        state.sync_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::RecordBody;
    use crate::types::TxnId;
    use tempfile::tempdir;

    fn noop(txn: u32, pgno: u32) -> LogRecord {
        LogRecord::new(
            TxnId::new(txn),
            Lsn::ZERO,
            RecordBody::Noop {
                pgno,
                page_lsn: Lsn::ZERO,
            },
        )
    }

    #[test]
    fn lsns_increase_and_read_back() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        assert_eq!(log.last_lsn().unwrap(), None);
        let a = log.append(&noop(1, 1)).unwrap();
        let b = log.append(&noop(1, 2)).unwrap();
        assert_eq!(a, Lsn::new(1, 0));
        assert!(b > a);
        assert_eq!(log.first_lsn().unwrap(), Some(a));
        assert_eq!(log.last_lsn().unwrap(), Some(b));

        let entry = log.read_at(b).unwrap().unwrap();
        assert_eq!(entry.record().unwrap(), noop(1, 2));
        assert_eq!(entry.prev, Some(a));
        assert_eq!(entry.next, None);
        assert_eq!(log.read_at(a).unwrap().unwrap().next, Some(b));
        assert!(log.read_at(Lsn::new(1, 10_000)).unwrap().is_none());
        assert!(log.read_at(Lsn::new(7, 0)).unwrap().is_none());
    }

    #[test]
    fn rotation_links_across_files() {
        let frame_len = (noop(1, 1).encode().len() + crate::log::codec::FRAME_OVERHEAD) as u64;
        let log = LogManager::in_memory(frame_len * 2).unwrap();
        let lsns: Vec<Lsn> = (0..5).map(|i| log.append(&noop(1, i)).unwrap()).collect();
        assert_eq!(lsns[1].file, 1);
        assert_eq!(lsns[2], Lsn::new(2, 0));
        assert_eq!(log.file_numbers(), vec![1, 2, 3]);

        let first_of_second = log.read_at(lsns[2]).unwrap().unwrap();
        assert_eq!(first_of_second.prev, Some(lsns[1]));
        assert_eq!(log.read_at(lsns[1]).unwrap().unwrap().next, Some(lsns[2]));
    }

    #[test]
    fn legacy_records_cannot_be_written() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        let legacy = LogRecord::new(
            TxnId::new(1),
            Lsn::ZERO,
            RecordBody::PgFree42 {
                pgno: 1,
                meta_lsn: Lsn::ZERO,
                page_lsn: Lsn::ZERO,
                next: 0,
                header: Vec::new(),
            },
        );
        assert!(matches!(
            log.append(&legacy),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let mut backend = InMemoryBackend::new();
        let first = encode_frame(&noop(1, 1).encode(), 0).unwrap();
        backend.append(&first).unwrap();
        let second = encode_frame(&noop(1, 2).encode(), first.len() as u32).unwrap();
        backend.append(&second[..second.len() - 3]).unwrap();

        let log = LogManager::from_backends(vec![Box::new(backend)], 1 << 20).unwrap();
        assert_eq!(log.last_lsn().unwrap(), Some(Lsn::new(1, 0)));
        let next = log.append(&noop(1, 3)).unwrap();
        assert_eq!(next, Lsn::new(1, first.len() as u32));
        assert_eq!(log.read_at(next).unwrap().unwrap().prev, Some(Lsn::new(1, 0)));
    }

    #[test]
    fn corrupt_frame_before_the_tail_fails_open() {
        let mut first = encode_frame(&noop(1, 1).encode(), 0).unwrap();
        let second = encode_frame(&noop(1, 2).encode(), first.len() as u32).unwrap();
        first[FRAME_HEADER_SIZE] ^= 0xff;
        let mut bytes = first;
        bytes.extend_from_slice(&second);
        assert!(matches!(
            LogManager::from_backends(vec![Box::new(InMemoryBackend::with_data(bytes))], 1 << 20),
            Err(CoreError::ChecksumMismatch { .. })
        ));

        let mut older = encode_frame(&noop(1, 1).encode(), 0).unwrap();
        older[FRAME_HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            LogManager::from_backends(
                vec![
                    Box::new(InMemoryBackend::with_data(older)),
                    Box::new(InMemoryBackend::new()),
                ],
                1 << 20,
            ),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn garbage_after_the_last_frame_fails_open() {
        let first = encode_frame(&noop(1, 1).encode(), 0).unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&[0u8; 40]);
        bytes.push(1);
        assert!(matches!(
            LogManager::from_backends(vec![Box::new(InMemoryBackend::with_data(bytes))], 1 << 20),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn sync_to_skips_durable_records() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        let a = log.append(&noop(1, 1)).unwrap();
        log.sync_to(a).unwrap();
        assert!(log.state.lock().dirty.is_empty());
        let b = log.append(&noop(1, 2)).unwrap();
        log.sync_to(a).unwrap();
        assert_eq!(log.state.lock().dirty.len(), 1);
        log.sync_to(b).unwrap();
        assert!(log.state.lock().dirty.is_empty());
        assert_eq!(log.state.lock().synced, Some(b));
    }

    #[test]
    fn append_with_sees_its_own_lsn() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        log.append(&noop(1, 1)).unwrap();
        let lsn = log
            .append_with(|lsn| {
                LogRecord::new(
                    TxnId::NONE,
                    Lsn::ZERO,
                    RecordBody::Noop {
                        pgno: 0,
                        page_lsn: lsn,
                    },
                )
            })
            .unwrap();
        let record = log.read_at(lsn).unwrap().unwrap().record().unwrap();
        assert!(matches!(record.body, RecordBody::Noop { page_lsn, .. } if page_lsn == lsn));
    }

    #[test]
    fn directory_log_reopens_all_files() {
        let dir = tempdir().unwrap();
        let frame_len = (noop(1, 1).encode().len() + crate::log::codec::FRAME_OVERHEAD) as u64;
        let last = {
            let log = LogManager::open_dir(dir.path(), frame_len * 2).unwrap();
            let mut last = Lsn::ZERO;
            for i in 0..4 {
                last = log.append(&noop(2, i)).unwrap();
            }
            log.sync().unwrap();
            last
        };
        assert!(dir.path().join("log.0000000002").exists());

        let log = LogManager::open_dir(dir.path(), frame_len * 2).unwrap();
        assert_eq!(log.last_lsn().unwrap(), Some(last));
        assert_eq!(log.first_lsn().unwrap(), Some(Lsn::new(1, 0)));
        assert_eq!(log.file_numbers(), vec![1, 2]);
    }

    #[test]
    fn log_file_names_parse() {
        assert_eq!(log_file_name(12), "log.0000000012");
        assert_eq!(parse_log_file_name("log.0000000012"), Some(12));
        assert_eq!(parse_log_file_name("log.12"), None);
        assert_eq!(parse_log_file_name("log.0000000000"), None);
        assert_eq!(parse_log_file_name("pages.db"), None);
    }
}
