//! Core type definitions for pagelog.

use serde::Serialize;
use std::fmt;

/// Page number within the page store.
pub type PageNo = u32;

/// "No page". Page 0 is the metadata page, so it never appears as a link.
pub const PGNO_INVALID: PageNo = 0;

/// The metadata page.
pub const PGNO_META: PageNo = 0;

/// Log sequence number: the position of a record in the log.
///
/// Ordered by `(file, offset)`. Log files are numbered from 1, so
/// [`Lsn::ZERO`] never names a real record and terminates undo chains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Lsn {
    /// Log file number.
    pub file: u32,
    /// Byte offset of the record frame within the file.
    pub offset: u32,
}

impl Lsn {
    /// The "no previous record" sentinel.
    pub const ZERO: Self = Self { file: 0, offset: 0 };

    /// Creates an LSN.
    #[must_use]
    pub const fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// Returns true for the sentinel.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.file == 0 && self.offset == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.file, self.offset)
    }
}

/// Transaction identifier.
///
/// Ids are issued in increasing order and may be recycled after a
/// `TxnRecycle` record; recovery tells incarnations apart by generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TxnId(pub u32);

impl TxnId {
    /// Records written outside any transaction.
    pub const NONE: Self = Self(0);

    /// The first id handed out.
    pub const FIRST: Self = Self(1);

    /// Creates a transaction id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true for [`TxnId::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}
