//! Error types for pagelog core.

use crate::types::Lsn;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in pagelog core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend or page store error.
    #[error("storage error: {0}")]
    Storage(#[from] pagelog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record body could not be decoded.
    #[error("malformed log record: {message}")]
    MalformedRecord {
        /// Description of the problem.
        message: String,
    },

    /// A record carries a tag with no registered handler.
    #[error("unsupported log record kind {kind}")]
    UnsupportedRecordKind {
        /// The numeric record kind.
        kind: u32,
    },

    /// An item does not fit on the target page.
    #[error("page {pgno} full: need {needed} bytes, {available} available")]
    PageFull {
        /// Target page.
        pgno: u32,
        /// Bytes needed, including the slot.
        needed: usize,
        /// Bytes free on the page.
        available: usize,
    },

    /// A slot index is out of range.
    #[error("page {pgno} has no slot {index} ({entries} entries)")]
    SlotNotFound {
        /// Target page.
        pgno: u32,
        /// Requested slot.
        index: u16,
        /// Number of slots on the page.
        entries: u16,
    },

    /// Recovery found the log in a state it cannot reconcile.
    #[error("recovery inconsistency at {lsn}: {message}")]
    RecoveryInconsistency {
        /// The offending record.
        lsn: Lsn,
        /// Description of the problem.
        message: String,
    },

    /// Log framing is corrupt.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A checksum failure marker was found; only catastrophic recovery may
    /// proceed.
    #[error("checksum failure logged at {lsn}: catastrophic recovery required")]
    CatastrophicRecoveryRequired {
        /// The marker record.
        lsn: Lsn,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Another process holds the environment lock.
    #[error("environment locked: another process has exclusive access")]
    EnvironmentLocked,
}

impl CoreError {
    /// Creates a malformed record error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Creates a recovery inconsistency error.
    pub fn inconsistency(lsn: Lsn, message: impl Into<String>) -> Self {
        Self::RecoveryInconsistency {
            lsn,
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
