//! Transaction manager.

use super::state::Transaction;
use super::timestamp;
use crate::error::{CoreError, CoreResult};
use crate::log::{LogManager, LogRecord, LogSource, RecordBody, RegopOp};
use crate::recovery::{
    DispatchTable, Limbo, ReplayContext, ReplayOp, ReplayOutcome, TxnKey, UndoChain,
};
use crate::types::{Lsn, TxnId};
use pagelog_storage::PageStore;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Hands out transaction ids and writes every transactional record.
///
/// Live mutations go through [`TransactionManager::log_and_apply`]: the
/// record is appended and synced first, then applied to the page store
/// through the same redo handler recovery uses. A live abort walks the transaction's
/// own undo chain and resolves its limbo pages before logging the abort
/// marker.
///
/// ## Checkpoints
///
/// `begin`, `log_and_apply`, `commit` and `abort` hold the checkpoint lock
/// in read mode while they touch the log; `checkpoint` and `recycle_ids`
/// take it in write mode, so they see a stable set of active transactions.
pub struct TransactionManager {
    log: Arc<LogManager>,
    pages: Arc<dyn PageStore>,
    dispatch: Arc<DispatchTable>,
    sync_on_commit: bool,
    next_txnid: AtomicU32,
    /// Active transactions and their first LSN (zero until they log).
    active: Mutex<BTreeMap<TxnId, Lsn>>,
    checkpoint_lock: RwLock<()>,
    last_checkpoint: Mutex<Lsn>,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    /// Creates a transaction manager handing out ids from 1.
    pub fn new(
        log: Arc<LogManager>,
        pages: Arc<dyn PageStore>,
        dispatch: Arc<DispatchTable>,
        sync_on_commit: bool,
    ) -> Self {
        Self::with_state(log, pages, dispatch, sync_on_commit, TxnId::FIRST, Lsn::ZERO)
    }

    /// Creates a transaction manager initialized from recovery state.
    pub fn with_state(
        log: Arc<LogManager>,
        pages: Arc<dyn PageStore>,
        dispatch: Arc<DispatchTable>,
        sync_on_commit: bool,
        next_txnid: TxnId,
        last_checkpoint: Lsn,
    ) -> Self {
        Self {
            log,
            pages,
            dispatch,
            sync_on_commit,
            next_txnid: AtomicU32::new(next_txnid.as_u32().max(1)),
            active: Mutex::new(BTreeMap::new()),
            checkpoint_lock: RwLock::new(()),
            last_checkpoint: Mutex::new(last_checkpoint),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// The log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// The page store.
    #[must_use]
    pub fn pages(&self) -> &dyn PageStore {
        self.pages.as_ref()
    }

    /// The dispatch table used to apply records.
    #[must_use]
    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    fn allocate_id(&self) -> CoreResult<TxnId> {
        self.next_txnid
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map(TxnId::new)
            .map_err(|_| CoreError::invalid_operation("transaction ids exhausted"))
    }

    /// Begins a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] once the id space is used
    /// up; see [`TransactionManager::recycle_ids`].
    pub fn begin(&self) -> CoreResult<Transaction> {
        let _guard = self.checkpoint_lock.read();
        let id = self.allocate_id()?;
        self.active.lock().insert(id, Lsn::ZERO);
        Ok(Transaction::new(id, TxnId::NONE))
    }

    /// Begins a transaction nested under `parent`.
    ///
    /// The child commits or aborts on its own; its marker names the parent
    /// but its outcome does not depend on the parent's.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `parent` is not active.
    pub fn begin_nested(&self, parent: &Transaction) -> CoreResult<Transaction> {
        if !parent.is_active() {
            return Err(CoreError::invalid_operation("parent transaction not active"));
        }
        let _guard = self.checkpoint_lock.read();
        let id = self.allocate_id()?;
        self.active.lock().insert(id, Lsn::ZERO);
        debug!(txn = %id, parent = %parent.id(), "nested transaction begun");
        Ok(Transaction::new(id, parent.id()))
    }

    fn context(&self) -> ReplayContext<'_> {
        ReplayContext {
            pages: self.pages.as_ref(),
            catastrophic: false,
        }
    }

    fn append(&self, txn: &mut Transaction, body: RecordBody) -> CoreResult<(Lsn, LogRecord)> {
        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }
        let record = LogRecord::new(txn.id(), txn.last_lsn(), body);
        let lsn = self.log.append(&record)?;
        if txn.first_lsn().is_zero() {
            self.active.lock().insert(txn.id(), lsn);
        }
        txn.note_record(lsn);
        Ok((lsn, record))
    }

    /// Logs `body` for `txn`, then applies it to the page store.
    ///
    /// The log is made durable up to the new record before any page
    /// carrying its LSN is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active, the append or
    /// sync fails, or the record cannot be applied.
    pub fn log_and_apply(&self, txn: &mut Transaction, body: RecordBody) -> CoreResult<Lsn> {
        let _guard = self.checkpoint_lock.read();
        let (lsn, record) = self.append(txn, body)?;
        self.log.sync_to(lsn)?;
        let outcome = self
            .dispatch
            .dispatch(&self.context(), &record, lsn, ReplayOp::Redo)?;
        if outcome == ReplayOutcome::Skipped && record.body.pgno().is_some() {
            debug!(%lsn, kind = record.name(), "live record changed no page");
        }
        Ok(lsn)
    }

    /// Logs a record that belongs to no transaction, without applying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub fn log_unowned(&self, body: RecordBody) -> CoreResult<Lsn> {
        let _guard = self.checkpoint_lock.read();
        self.log.append(&LogRecord::new(TxnId::NONE, Lsn::ZERO, body))
    }

    fn marker(&self, txn: &mut Transaction, op: RegopOp) -> CoreResult<Lsn> {
        let parent = txn.parent();
        let (lsn, _) = self.append(
            txn,
            RecordBody::TxnRegop {
                op,
                timestamp: timestamp(),
                parent,
            },
        )?;
        self.active.lock().remove(&txn.id());
        Ok(lsn)
    }

    /// Commits a transaction by logging its commit marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write
    /// or sync fails.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Lsn> {
        let lsn = {
            let _guard = self.checkpoint_lock.read();
            self.marker(txn, RegopOp::Commit)?
        };
        if self.sync_on_commit {
            self.log.sync()?;
        }
        txn.mark_committed();
        self.committed.fetch_add(1, Ordering::SeqCst);
        debug!(txn = %txn.id(), %lsn, "transaction committed");
        Ok(lsn)
    }

    /// Aborts a transaction.
    ///
    /// Every record is undone newest first, pages the transaction
    /// allocated or freed are put back where they belong under an internal
    /// transaction, and the abort marker is logged last.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or any undo step
    /// fails.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<Lsn> {
        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }
        let key = TxnKey {
            txnid: txn.id(),
            generation: 0,
        };
        let mut limbo = Limbo::new();
        let ctx = self.context();
        for step in UndoChain::new(self.log.as_ref(), txn.id(), txn.last_lsn()) {
            let (lsn, record) = step?;
            self.dispatch.dispatch(&ctx, &record, lsn, ReplayOp::LiveAbort)?;
            limbo.note(key, lsn, &record.body);
        }

        if !limbo.is_empty() {
            let mut internal = self.begin()?;
            let resolved = limbo.resolve(self.pages.as_ref(), |_| true, &mut |body| {
                self.log_and_apply(&mut internal, body).map(|_| ())
            })?;
            self.commit(&mut internal)?;
            debug!(txn = %txn.id(), resolved, "aborted transaction's pages resolved");
        }

        let lsn = {
            let _guard = self.checkpoint_lock.read();
            self.marker(txn, RegopOp::Abort)?
        };
        txn.mark_aborted();
        self.aborted.fetch_add(1, Ordering::SeqCst);
        debug!(txn = %txn.id(), %lsn, "transaction aborted");
        Ok(lsn)
    }

    /// Restarts transaction ids at 1, logging the recycled range so that
    /// recovery can tell old and new uses of an id apart.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] while any transaction is
    /// active.
    pub fn recycle_ids(&self) -> CoreResult<Lsn> {
        let _guard = self.checkpoint_lock.write();
        if !self.active.lock().is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot recycle ids with active transactions",
            ));
        }
        let max = self.next_txnid.load(Ordering::SeqCst).saturating_sub(1);
        let lsn = self.log.append(&LogRecord::new(
            TxnId::NONE,
            Lsn::ZERO,
            RecordBody::TxnRecycle {
                min: TxnId::FIRST,
                max: TxnId::new(max),
            },
        ))?;
        self.log.sync()?;
        self.next_txnid.store(TxnId::FIRST.as_u32(), Ordering::SeqCst);
        info!(%lsn, max, "transaction ids recycled");
        Ok(lsn)
    }

    /// Writes a checkpoint and returns its LSN.
    ///
    /// The log is synced before the pages, then the checkpoint record is
    /// appended. Its `ckp_lsn` is the first record of the oldest active
    /// transaction, or the checkpoint itself when none has logged anything.
    ///
    /// # Errors
    ///
    /// Returns an error if a sync or the append fails.
    pub fn checkpoint(&self) -> CoreResult<Lsn> {
        let _guard = self.checkpoint_lock.write();
        self.log.sync()?;
        self.pages.sync()?;

        let oldest = self
            .active
            .lock()
            .values()
            .filter(|lsn| !lsn.is_zero())
            .min()
            .copied();
        let last_ckp = *self.last_checkpoint.lock();
        let next_txnid = TxnId::new(self.next_txnid.load(Ordering::SeqCst));
        let now = timestamp();
        let lsn = self.log.append_with(|own| {
            LogRecord::new(
                TxnId::NONE,
                Lsn::ZERO,
                RecordBody::TxnCheckpoint {
                    ckp_lsn: oldest.map_or(own, |first| first.min(own)),
                    last_ckp,
                    timestamp: now,
                    next_txnid,
                },
            )
        })?;
        self.log.sync()?;
        *self.last_checkpoint.lock() = lsn;
        info!(%lsn, ?oldest, "checkpoint written");
        Ok(lsn)
    }

    /// LSN of the last checkpoint, or [`Lsn::ZERO`].
    #[must_use]
    pub fn last_checkpoint(&self) -> Lsn {
        *self.last_checkpoint.lock()
    }

    /// Id the next `begin` will hand out.
    #[must_use]
    pub fn next_txnid(&self) -> TxnId {
        TxnId::new(self.next_txnid.load(Ordering::SeqCst))
    }

    /// Number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Transactions committed since open.
    #[must_use]
    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Transactions aborted since open.
    #[must_use]
    pub fn aborted_count(&self) -> u64 {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txnid", &self.next_txnid())
            .field("active_count", &self.active_count())
            .field("last_checkpoint", &self.last_checkpoint())
            .finish_non_exhaustive()
    }
}
