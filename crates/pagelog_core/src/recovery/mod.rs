//! Crash recovery.
//!
//! Recovery runs in up to four steps over the log window that starts at the
//! last checkpoint's `ckp_lsn`:
//!
//! 1. a backward pass that builds the [`Ledger`] and the [`Limbo`] set,
//! 2. undo of every aborted transaction, chains merged newest first,
//! 3. a forward pass that redoes committed work,
//! 4. limbo resolution under an internal transaction.
//!
//! Which steps run depends on the [`RecoveryMode`]. Every step is safe to
//! repeat: handlers compare page LSNs before touching a page, and limbo
//! resolution checks the actual free list.

pub mod container;
mod dispatch;
mod handlers;
mod ledger;
mod limbo;
mod undo;

pub use dispatch::{DispatchTable, PrintFn, RecoverFn, ReplayContext, ReplayOp, ReplayOutcome};
pub use ledger::{Ledger, LedgerEntry, TxnKey, TxnStatus};
pub use limbo::{Limbo, LimboEntry, LimboFlavor};
pub use undo::UndoChain;

use crate::error::{CoreError, CoreResult};
use crate::log::{BackwardScan, ForwardScan, LogRecord, LogSource, RecordBody, RecordKind, RegopOp};
use crate::txn::timestamp;
use crate::types::{Lsn, TxnId};
use pagelog_storage::PageStore;
use serde::Serialize;
use std::collections::BinaryHeap;
use tracing::{debug, info};

/// Which recovery steps to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Undo losers, redo winners, resolve limbo.
    FullCrash,
    /// Undo losers and resolve limbo; no redo.
    BackwardRoll,
    /// Redo winners and unresolved transactions; no undo.
    ForwardRoll,
}

impl RecoveryMode {
    const fn undoes(self) -> bool {
        !matches!(self, Self::ForwardRoll)
    }

    const fn redoes(self) -> bool {
        !matches!(self, Self::BackwardRoll)
    }
}

/// Counts from one recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// First record of the window, if the log was not empty.
    pub start_lsn: Option<Lsn>,
    /// Last record of the window.
    pub end_lsn: Option<Lsn>,
    /// Records read by the backward pass.
    pub records_scanned: u64,
    /// Handler calls that changed a page during redo.
    pub applied: u64,
    /// Handler calls that changed nothing, plus records not redone.
    pub skipped: u64,
    /// Handler calls that reversed a change.
    pub undone: u64,
    /// Compensating records logged for limbo pages.
    pub limbo_resolved: u64,
    /// Transactions forced to abort for lack of a marker.
    pub forced_aborts: u64,
    /// First transaction id safe to hand out afterwards.
    pub next_txnid: TxnId,
}

impl RecoveryReport {
    fn count(&mut self, outcome: ReplayOutcome) {
        match outcome {
            ReplayOutcome::Applied => self.applied += 1,
            ReplayOutcome::Undone => self.undone += 1,
            ReplayOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// One recovery run and the state it builds.
#[derive(Debug, Default)]
pub struct Recovery {
    ledger: Ledger,
    limbo: Limbo,
    catastrophic: bool,
    report: RecoveryReport,
}

impl Recovery {
    /// Creates a run with an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows replay to pass logged checksum failures.
    #[must_use]
    pub fn catastrophic(mut self, value: bool) -> Self {
        self.catastrophic = value;
        self
    }

    /// The ledger as built by the last run.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The limbo set as built by the last run.
    #[must_use]
    pub fn limbo(&self) -> &Limbo {
        &self.limbo
    }

    /// Recovers `pages` from `log`. `checkpoint` is the LSN of the last
    /// checkpoint record, if any.
    ///
    /// # Errors
    ///
    /// Any error is fatal: unsupported record kinds, broken undo chains,
    /// corrupt frames, checksum markers outside catastrophic mode and
    /// storage failures all abort recovery.
    pub fn run(
        &mut self,
        log: &dyn LogSource,
        pages: &dyn PageStore,
        dispatch: &DispatchTable,
        checkpoint: Option<Lsn>,
        mode: RecoveryMode,
    ) -> CoreResult<RecoveryReport> {
        info!(?mode, checkpoint = ?checkpoint, "recovery started");
        let Some(end) = log.last_lsn()? else {
            self.report.next_txnid = TxnId::FIRST;
            info!("log empty, nothing to recover");
            return Ok(self.report.clone());
        };
        let (start, ckp_next) = match checkpoint {
            Some(at) => read_checkpoint(log, at)?,
            None => (log.first_lsn()?.unwrap_or(end), TxnId::NONE),
        };
        self.report.start_lsn = Some(start);
        self.report.end_lsn = Some(end);
        let ctx = ReplayContext {
            pages,
            catastrophic: self.catastrophic,
        };

        self.backward_pass(log, dispatch, start, end)?;
        if mode.undoes() {
            self.report.forced_aborts = self.ledger.abort_unresolved() as u64;
            self.undo_pass(log, dispatch, &ctx)?;
        }
        if mode.redoes() {
            self.forward_pass(log, dispatch, &ctx, start, end, mode)?;
        }

        let mut highest = self
            .ledger
            .max_txnid()
            .as_u32()
            .max(ckp_next.as_u32().saturating_sub(1));
        if mode.undoes() && !self.limbo.is_empty() {
            let internal = next_id(highest)?;
            let resolved = self.resolve_limbo(log, dispatch, &ctx, internal)?;
            if resolved > 0 {
                highest = internal.as_u32();
            }
            self.report.limbo_resolved = resolved as u64;
        }
        self.report.next_txnid = next_id(highest)?;

        pages.sync()?;
        info!(
            applied = self.report.applied,
            undone = self.report.undone,
            skipped = self.report.skipped,
            limbo = self.report.limbo_resolved,
            next_txnid = %self.report.next_txnid,
            "recovery finished"
        );
        Ok(self.report.clone())
    }

    fn backward_pass(
        &mut self,
        log: &dyn LogSource,
        dispatch: &DispatchTable,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<()> {
        for entry in BackwardScan::new(log, end).down_to(start) {
            let entry = entry?;
            let record = entry.record()?;
            if !dispatch.contains(record.code()) {
                return Err(CoreError::UnsupportedRecordKind {
                    kind: record.code(),
                });
            }
            let record = record.normalize();
            self.report.records_scanned += 1;

            match &record.body {
                RecordBody::TxnRecycle { min, max } => self.ledger.push_recycle(*min, *max),
                _ if record.txnid.is_none() => {}
                RecordBody::TxnRegop { op, parent, .. } => {
                    let key = self.ledger.key(record.txnid);
                    self.ledger.observe(key, entry.lsn);
                    let status = match op {
                        RegopOp::Commit => TxnStatus::Committed,
                        RegopOp::Abort => TxnStatus::Aborted,
                    };
                    self.ledger.resolve(key, status, *parent);
                }
                body => {
                    let key = self.ledger.key(record.txnid);
                    if self.ledger.observe(key, entry.lsn).status == TxnStatus::Unknown {
                        self.limbo.note(key, entry.lsn, body);
                    }
                }
            }
        }
        info!(
            records = self.report.records_scanned,
            transactions = self.ledger.len(),
            limbo = self.limbo.len(),
            "backward pass done"
        );
        Ok(())
    }

    fn undo_pass(
        &mut self,
        log: &dyn LogSource,
        dispatch: &DispatchTable,
        ctx: &ReplayContext<'_>,
    ) -> CoreResult<()> {
        let mut chains = Vec::new();
        let mut heads: Vec<Option<LogRecord>> = Vec::new();
        let mut heap = BinaryHeap::new();
        for key in self.ledger.aborted() {
            let Some(entry) = self.ledger.get(key) else {
                continue;
            };
            let mut chain = UndoChain::new(log, key.txnid, entry.last_lsn);
            let slot = chains.len();
            match chain.next() {
                Some(step) => {
                    let (lsn, record) = step?;
                    heap.push((lsn, slot));
                    heads.push(Some(record));
                }
                None => heads.push(None),
            }
            chains.push((key, entry.record_count, entry.last_lsn, chain));
        }

        let before = self.report.undone;
        while let Some((lsn, slot)) = heap.pop() {
            let Some(record) = heads[slot].take() else {
                continue;
            };
            let outcome = dispatch.dispatch(ctx, &record, lsn, ReplayOp::Undo)?;
            self.report.count(outcome);

            let (key, expected, last_lsn, chain) = &mut chains[slot];
            match chain.next() {
                Some(step) => {
                    let (prev, record) = step?;
                    heap.push((prev, slot));
                    heads[slot] = Some(record);
                }
                None if chain.steps() != *expected => {
                    return Err(CoreError::inconsistency(
                        *last_lsn,
                        format!(
                            "undo chain of {key} has {} records, {expected} seen in the log",
                            chain.steps()
                        ),
                    ));
                }
                None => debug!(txn = %key, records = *expected, "transaction undone"),
            }
        }
        info!(
            transactions = chains.len(),
            undone = self.report.undone - before,
            "undo pass done"
        );
        Ok(())
    }

    fn forward_pass(
        &mut self,
        log: &dyn LogSource,
        dispatch: &DispatchTable,
        ctx: &ReplayContext<'_>,
        start: Lsn,
        end: Lsn,
        mode: RecoveryMode,
    ) -> CoreResult<()> {
        let before = self.report.applied;
        for entry in ForwardScan::new(log, start).until(end) {
            let entry = entry?;
            let record = entry.record()?.normalize();
            if record.kind() == Some(RecordKind::TxnRecycle) {
                self.ledger.pop_recycle();
            }
            let redo = if record.txnid.is_none() {
                true
            } else {
                match self.ledger.status(self.ledger.key(record.txnid)) {
                    TxnStatus::Committed => true,
                    TxnStatus::Unknown => mode == RecoveryMode::ForwardRoll,
                    TxnStatus::Aborted => false,
                }
            };
            if redo {
                let outcome = dispatch.dispatch(ctx, &record, entry.lsn, ReplayOp::Redo)?;
                self.report.count(outcome);
            } else {
                self.report.skipped += 1;
            }
        }
        info!(applied = self.report.applied - before, "forward pass done");
        Ok(())
    }

    fn resolve_limbo(
        &self,
        log: &dyn LogSource,
        dispatch: &DispatchTable,
        ctx: &ReplayContext<'_>,
        internal: TxnId,
    ) -> CoreResult<usize> {
        let mut prev = Lsn::ZERO;
        let resolved = self.limbo.resolve(
            ctx.pages,
            |key| self.ledger.status(key) == TxnStatus::Aborted,
            &mut |body| {
                let record = LogRecord::new(internal, prev, body);
                let lsn = log.append(&record)?;
                prev = lsn;
                log.sync_to(lsn)?;
                dispatch.dispatch(ctx, &record, lsn, ReplayOp::Redo)?;
                Ok(())
            },
        )?;
        if resolved > 0 {
            log.append(&LogRecord::new(
                internal,
                prev,
                RecordBody::TxnRegop {
                    op: RegopOp::Commit,
                    timestamp: timestamp(),
                    parent: TxnId::NONE,
                },
            ))?;
            log.sync()?;
        }
        info!(resolved, txn = %internal, "limbo resolved");
        Ok(resolved)
    }
}

fn next_id(highest: u32) -> CoreResult<TxnId> {
    highest
        .checked_add(1)
        .map(TxnId::new)
        .ok_or_else(|| CoreError::invalid_operation("transaction ids exhausted"))
}

fn read_checkpoint(log: &dyn LogSource, at: Lsn) -> CoreResult<(Lsn, TxnId)> {
    let entry = log
        .read_at(at)?
        .ok_or_else(|| CoreError::inconsistency(at, "checkpoint record missing"))?;
    match entry.record()?.body {
        RecordBody::TxnCheckpoint {
            ckp_lsn,
            next_txnid,
            ..
        } => Ok((if ckp_lsn.is_zero() { at } else { ckp_lsn }, next_txnid)),
        other => Err(CoreError::inconsistency(
            at,
            format!("expected a checkpoint, found {}", other.name()),
        )),
    }
}

/// Recovers `pages` from `log` with a fresh [`Recovery`].
///
/// # Errors
///
/// See [`Recovery::run`].
pub fn run_recovery(
    log: &dyn LogSource,
    pages: &dyn PageStore,
    dispatch: &DispatchTable,
    checkpoint: Option<Lsn>,
    mode: RecoveryMode,
) -> CoreResult<RecoveryReport> {
    Recovery::new().run(log, pages, dispatch, checkpoint, mode)
}

/// LSN of the newest checkpoint record, scanning back from the tail.
///
/// # Errors
///
/// Returns an error if the log cannot be read.
pub fn find_last_checkpoint(log: &dyn LogSource) -> CoreResult<Option<Lsn>> {
    let tag = RecordKind::TxnCheckpoint.code().to_le_bytes();
    for entry in BackwardScan::from_tail(log)? {
        let entry = entry?;
        if entry.body.get(..4) == Some(&tag[..]) {
            return Ok(Some(entry.lsn));
        }
    }
    Ok(None)
}
