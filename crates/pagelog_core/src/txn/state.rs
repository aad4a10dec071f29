//! Transaction state.

use crate::types::{Lsn, TxnId};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can log operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// A transaction handle.
///
/// Tracks the head of the transaction's `prev_lsn` chain; every record it
/// logs links back to the previous one.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    parent: TxnId,
    state: TransactionState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    record_count: u32,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, parent: TxnId) -> Self {
        Self {
            id,
            parent,
            state: TransactionState::Active,
            first_lsn: Lsn::ZERO,
            last_lsn: Lsn::ZERO,
            record_count: 0,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Parent of a nested transaction, or [`TxnId::NONE`].
    #[must_use]
    pub fn parent(&self) -> TxnId {
        self.parent
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// First record logged, or [`Lsn::ZERO`].
    #[must_use]
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// Last record logged, or [`Lsn::ZERO`].
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Records logged so far, markers included.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub(crate) fn note_record(&mut self, lsn: Lsn) {
        if self.first_lsn.is_zero() {
            self.first_lsn = lsn;
        }
        self.last_lsn = lsn;
        self.record_count += 1;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_head_follows_records() {
        let mut txn = Transaction::new(TxnId::new(7), TxnId::NONE);
        assert!(txn.is_active());
        txn.note_record(Lsn::new(1, 10));
        txn.note_record(Lsn::new(1, 50));
        assert_eq!(txn.first_lsn(), Lsn::new(1, 10));
        assert_eq!(txn.last_lsn(), Lsn::new(1, 50));
        assert_eq!(txn.record_count(), 2);
        txn.mark_aborted();
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}
