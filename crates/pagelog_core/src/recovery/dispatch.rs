//! Table-driven dispatch of log records to recovery handlers.

use crate::error::{CoreError, CoreResult};
use crate::log::{print_record, LogRecord};
use crate::types::Lsn;
use pagelog_storage::PageStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a handler is asked to do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOp {
    /// Reapply the change if the page has not seen it.
    Redo,
    /// Reverse the change during recovery.
    Undo,
    /// Reverse the change for a transaction aborting at run time.
    LiveAbort,
}

impl ReplayOp {
    /// Whether the change is being reversed.
    #[must_use]
    pub const fn is_undo(self) -> bool {
        matches!(self, Self::Undo | Self::LiveAbort)
    }
}

/// Result of handling one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The change was (re)applied to at least one page.
    Applied,
    /// The change was reversed on at least one page.
    Undone,
    /// Nothing needed doing.
    Skipped,
}

/// State a handler may touch.
pub struct ReplayContext<'a> {
    /// Page store being recovered.
    pub pages: &'a dyn PageStore,
    /// Whether checksum failure markers may be passed.
    pub catastrophic: bool,
}

/// Recovery handler for one record kind.
pub type RecoverFn = Arc<
    dyn Fn(&ReplayContext<'_>, &LogRecord, Lsn, ReplayOp) -> CoreResult<ReplayOutcome>
        + Send
        + Sync,
>;

/// Diagnostic printer for one record kind.
pub type PrintFn = Arc<dyn Fn(&LogRecord) -> String + Send + Sync>;

#[derive(Clone)]
struct Handler {
    name: String,
    recover: RecoverFn,
    print: Option<PrintFn>,
}

/// Maps numeric record tags to their recovery and print handlers.
///
/// The table starts empty; [`DispatchTable::with_core_handlers`] fills in
/// the page and transaction records, and layered components add their own
/// tags through [`DispatchTable::register_kind`]. Any `u32` outside
/// [`crate::log::RecordKind`] may be registered; such records reach their
/// handler as [`crate::log::RecordBody::Other`]. A record whose tag has no
/// entry cannot be recovered.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<u32, Handler>,
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.values().map(|h| h.name.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("DispatchTable").field("kinds", &names).finish()
    }
}

impl DispatchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with handlers for every page, transaction and legacy
    /// record kind.
    #[must_use]
    pub fn with_core_handlers() -> Self {
        let mut table = Self::new();
        super::handlers::register_core(&mut table);
        table
    }

    /// Registers (or replaces) the handlers for tag `kind`.
    pub fn register_kind(
        &mut self,
        kind: impl Into<u32>,
        name: impl Into<String>,
        recover: RecoverFn,
        print: Option<PrintFn>,
    ) {
        self.handlers.insert(
            kind.into(),
            Handler {
                name: name.into(),
                recover,
                print,
            },
        );
    }

    /// Whether tag `kind` has a handler.
    #[must_use]
    pub fn contains(&self, kind: impl Into<u32>) -> bool {
        self.handlers.contains_key(&kind.into())
    }

    /// Registered name of tag `kind`.
    #[must_use]
    pub fn name(&self, kind: impl Into<u32>) -> Option<&str> {
        self.handlers.get(&kind.into()).map(|h| h.name.as_str())
    }

    /// Runs the handler for `record`, logged at `lsn`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedRecordKind`] if the kind has no
    /// handler, or whatever the handler returns.
    pub fn dispatch(
        &self,
        ctx: &ReplayContext<'_>,
        record: &LogRecord,
        lsn: Lsn,
        op: ReplayOp,
    ) -> CoreResult<ReplayOutcome> {
        let kind = record.code();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(CoreError::UnsupportedRecordKind { kind })?;
        (handler.recover)(ctx, record, lsn, op)
    }

    /// Renders an encoded record, preferring a registered printer. Never
    /// fails: anything undecodable is hex dumped.
    #[must_use]
    pub fn print(&self, bytes: &[u8]) -> String {
        match LogRecord::decode(bytes) {
            Ok(record) => match self.handlers.get(&record.code()).and_then(|h| h.print.as_ref()) {
                Some(print) => print(&record),
                None => print_record(bytes),
            },
            Err(_) => print_record(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{RecordBody, RecordKind};
    use crate::types::TxnId;
    use pagelog_storage::MemoryPageStore;

    fn debug_record() -> LogRecord {
        LogRecord::new(
            TxnId::new(3),
            Lsn::ZERO,
            RecordBody::Debug {
                op: b"put".to_vec(),
                key: Vec::new(),
                data: Vec::new(),
                flags: 0,
            },
        )
    }

    #[test]
    fn unregistered_kind_is_unsupported() {
        let table = DispatchTable::new();
        let pages = MemoryPageStore::new(512);
        let ctx = ReplayContext {
            pages: &pages,
            catastrophic: false,
        };
        let err = table
            .dispatch(&ctx, &debug_record(), Lsn::new(1, 0), ReplayOp::Redo)
            .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedRecordKind { kind: 47 }));
    }

    #[test]
    fn registered_handler_runs_and_prints() {
        let mut table = DispatchTable::new();
        table.register_kind(
            RecordKind::Debug,
            "debug",
            Arc::new(|_: &ReplayContext<'_>, _: &LogRecord, _: Lsn, op: ReplayOp| {
                Ok(if op.is_undo() {
                    ReplayOutcome::Undone
                } else {
                    ReplayOutcome::Applied
                })
            }),
            Some(Arc::new(|record: &LogRecord| format!("debug from {}", record.txnid))),
        );
        let pages = MemoryPageStore::new(512);
        let ctx = ReplayContext {
            pages: &pages,
            catastrophic: false,
        };
        let record = debug_record();
        assert_eq!(
            table.dispatch(&ctx, &record, Lsn::new(1, 0), ReplayOp::LiveAbort).unwrap(),
            ReplayOutcome::Undone
        );
        assert_eq!(table.print(&record.encode()), "debug from txn:3");
        assert_eq!(table.name(RecordKind::Debug), Some("debug"));
    }

    #[test]
    fn unknown_tag_reaches_its_handler() {
        let mut table = DispatchTable::with_core_handlers();
        let record = LogRecord::new(
            TxnId::new(3),
            Lsn::ZERO,
            RecordBody::Other {
                kind: 200,
                bytes: vec![7, 0, 0, 0],
            },
        );
        let pages = MemoryPageStore::new(512);
        let ctx = ReplayContext {
            pages: &pages,
            catastrophic: false,
        };
        assert!(!table.contains(200u32));
        assert!(matches!(
            table.dispatch(&ctx, &record, Lsn::new(1, 0), ReplayOp::Redo),
            Err(CoreError::UnsupportedRecordKind { kind: 200 })
        ));

        table.register_kind(
            200u32,
            "tally",
            Arc::new(|_: &ReplayContext<'_>, record: &LogRecord, _: Lsn, _: ReplayOp| {
                match &record.body {
                    RecordBody::Other { bytes, .. } if bytes == &[7, 0, 0, 0] => {
                        Ok(ReplayOutcome::Applied)
                    }
                    _ => Ok(ReplayOutcome::Skipped),
                }
            }),
            None,
        );
        let decoded = LogRecord::decode(&record.encode()).unwrap();
        assert_eq!(
            table.dispatch(&ctx, &decoded, Lsn::new(1, 0), ReplayOp::Redo).unwrap(),
            ReplayOutcome::Applied
        );
        assert_eq!(table.name(200u32), Some("tally"));
        assert!(table.print(&record.encode()).starts_with("[other] txn:3"));
    }

    #[test]
    fn print_falls_back_without_printer() {
        let table = DispatchTable::with_core_handlers();
        let record = debug_record();
        assert_eq!(table.print(&record.encode()), print_record(&record.encode()));
        assert!(table.print(&[1, 2, 3]).starts_with("unprintable record"));
    }
}
