//! Traversal of one transaction's backward `prev_lsn` chain.

use crate::error::{CoreError, CoreResult};
use crate::log::{LogRecord, LogSource};
use crate::types::{Lsn, TxnId};

/// Yields a transaction's records newest first by following `prev_lsn`
/// links through the log. Only the current record is held in memory.
///
/// A link that points at no record, at another transaction's record, or
/// that fails to decrease ends the walk with
/// [`CoreError::RecoveryInconsistency`].
pub struct UndoChain<'a> {
    log: &'a dyn LogSource,
    txnid: TxnId,
    next: Lsn,
    steps: u32,
}

impl<'a> UndoChain<'a> {
    /// Starts at `last`, the transaction's newest record.
    #[must_use]
    pub fn new(log: &'a dyn LogSource, txnid: TxnId, last: Lsn) -> Self {
        Self {
            log,
            txnid,
            next: last,
            steps: 0,
        }
    }

    /// Records yielded so far.
    #[must_use]
    pub fn steps(&self) -> u32 {
        self.steps
    }

    fn step(&mut self, lsn: Lsn) -> CoreResult<LogRecord> {
        let entry = match self.log.read_at(lsn) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Err(CoreError::inconsistency(
                    lsn,
                    format!("{} chain points at a missing record", self.txnid),
                ))
            }
            Err(CoreError::LogCorruption { message }) => {
                return Err(CoreError::inconsistency(lsn, message));
            }
            Err(err) => return Err(err),
        };
        let record = entry.record()?.normalize();
        if record.txnid != self.txnid {
            return Err(CoreError::inconsistency(
                lsn,
                format!("{} chain reaches a record of {}", self.txnid, record.txnid),
            ));
        }
        if !record.prev_lsn.is_zero() && record.prev_lsn >= lsn {
            return Err(CoreError::inconsistency(
                lsn,
                format!("prev link {} does not decrease", record.prev_lsn),
            ));
        }
        Ok(record)
    }
}

impl Iterator for UndoChain<'_> {
    type Item = CoreResult<(Lsn, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_zero() {
            return None;
        }
        let lsn = self.next;
        match self.step(lsn) {
            Ok(record) => {
                self.next = record.prev_lsn;
                self.steps += 1;
                Some(Ok((lsn, record)))
            }
            Err(err) => {
                self.next = Lsn::ZERO;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogManager, RecordBody};

    fn noop(txn: u32, prev: Lsn) -> LogRecord {
        LogRecord::new(
            TxnId::new(txn),
            prev,
            RecordBody::Noop {
                pgno: 1,
                page_lsn: Lsn::ZERO,
            },
        )
    }

    #[test]
    fn interleaved_chain_yields_only_its_records() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        let a1 = log.append(&noop(1, Lsn::ZERO)).unwrap();
        let b1 = log.append(&noop(2, Lsn::ZERO)).unwrap();
        let a2 = log.append(&noop(1, a1)).unwrap();
        log.append(&noop(2, b1)).unwrap();
        let a3 = log.append(&noop(1, a2)).unwrap();

        let mut chain = UndoChain::new(&log, TxnId::new(1), a3);
        let lsns: Vec<Lsn> = chain.by_ref().map(|r| r.unwrap().0).collect();
        assert_eq!(lsns, vec![a3, a2, a1]);
        assert_eq!(chain.steps(), 3);
    }

    #[test]
    fn non_decreasing_link_is_inconsistent() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        let first = log.append(&noop(1, Lsn::ZERO)).unwrap();
        let looped = log.append(&noop(1, Lsn::new(9, 0))).unwrap();
        let err = UndoChain::new(&log, TxnId::new(1), looped)
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CoreError::RecoveryInconsistency { lsn, .. } if lsn == looped));
        assert!(first < looped);
    }

    #[test]
    fn dangling_or_foreign_links_are_inconsistent() {
        let log = LogManager::in_memory(1 << 20).unwrap();
        let other = log.append(&noop(2, Lsn::ZERO)).unwrap();
        let mine = log.append(&noop(1, other)).unwrap();
        let results: Vec<_> = UndoChain::new(&log, TxnId::new(1), mine).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(CoreError::RecoveryInconsistency { .. })));

        let missing = UndoChain::new(&log, TxnId::new(1), Lsn::new(1, 4000))
            .next()
            .unwrap();
        assert!(matches!(missing, Err(CoreError::RecoveryInconsistency { .. })));
    }
}
