//! Transaction status ledger built by the backward pass.

use crate::types::{Lsn, TxnId};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Final state of a transaction as far as recovery knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// No commit or abort marker seen.
    Unknown,
    /// Commit marker seen.
    Committed,
    /// Abort marker seen, or forced at the end of the scan.
    Aborted,
}

/// A transaction id qualified by its recycle generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnKey {
    /// The id.
    pub txnid: TxnId,
    /// Recycle ranges covering the id at the record's position.
    pub generation: u32,
}

impl fmt::Display for TxnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.txnid, self.generation)
    }
}

/// What the ledger knows about one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Current status.
    pub status: TxnStatus,
    /// Newest record seen.
    pub last_lsn: Lsn,
    /// Oldest record seen.
    pub first_lsn: Lsn,
    /// Records seen, markers included.
    pub record_count: u32,
    /// Parent named by the transaction's marker.
    pub parent: TxnId,
}

/// Per-transaction status keyed by `(txnid, generation)`.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<TxnKey, LedgerEntry>,
    recycled: Vec<(TxnId, TxnId)>,
    max_txnid: TxnId,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a recycled id range (scanning backward past a recycle record).
    pub fn push_recycle(&mut self, min: TxnId, max: TxnId) {
        self.recycled.push((min, max));
    }

    /// Leaves the most recent recycled range (scanning forward past it).
    pub fn pop_recycle(&mut self) {
        self.recycled.pop();
    }

    /// Generation of `txnid` at the current scan position.
    #[must_use]
    pub fn generation(&self, txnid: TxnId) -> u32 {
        self.recycled
            .iter()
            .filter(|(min, max)| *min <= txnid && txnid <= *max)
            .count() as u32
    }

    /// Key of `txnid` at the current scan position.
    #[must_use]
    pub fn key(&self, txnid: TxnId) -> TxnKey {
        TxnKey {
            txnid,
            generation: self.generation(txnid),
        }
    }

    /// Notes a record of `key` at `lsn`. Must be called in descending LSN
    /// order.
    pub fn observe(&mut self, key: TxnKey, lsn: Lsn) -> &LedgerEntry {
        if key.txnid > self.max_txnid {
            self.max_txnid = key.txnid;
        }
        let entry = self.entries.entry(key).or_insert(LedgerEntry {
            status: TxnStatus::Unknown,
            last_lsn: lsn,
            first_lsn: lsn,
            record_count: 0,
            parent: TxnId::NONE,
        });
        entry.first_lsn = lsn;
        entry.record_count += 1;
        entry
    }

    /// Records a marker's verdict. Only `Unknown` entries change; returns
    /// whether this one did.
    pub fn resolve(&mut self, key: TxnKey, status: TxnStatus, parent: TxnId) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.status == TxnStatus::Unknown && status != TxnStatus::Unknown => {
                entry.status = status;
                entry.parent = parent;
                true
            }
            _ => false,
        }
    }

    /// Marks every `Unknown` entry aborted and returns how many there were.
    pub fn abort_unresolved(&mut self) -> usize {
        let mut forced = 0;
        for (key, entry) in &mut self.entries {
            if entry.status == TxnStatus::Unknown {
                warn!(txn = %key, last_lsn = %entry.last_lsn, "unresolved transaction aborted");
                entry.status = TxnStatus::Aborted;
                forced += 1;
            }
        }
        forced
    }

    /// Status of `txnid` in its current generation; `Unknown` if never seen.
    #[must_use]
    pub fn find(&self, txnid: TxnId) -> TxnStatus {
        self.status(self.key(txnid))
    }

    /// Status of a specific key; `Unknown` if never seen.
    #[must_use]
    pub fn status(&self, key: TxnKey) -> TxnStatus {
        self.entries
            .get(&key)
            .map_or(TxnStatus::Unknown, |entry| entry.status)
    }

    /// Entry for a specific key.
    #[must_use]
    pub fn get(&self, key: TxnKey) -> Option<&LedgerEntry> {
        self.entries.get(&key)
    }

    /// Keys with status `Aborted`, in ascending order.
    #[must_use]
    pub fn aborted(&self) -> Vec<TxnKey> {
        let mut keys: Vec<TxnKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.status == TxnStatus::Aborted)
            .map(|(key, _)| *key)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Largest id seen.
    #[must_use]
    pub fn max_txnid(&self) -> TxnId {
        self.max_txnid
    }

    /// Number of transactions tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no transaction was seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u32) -> TxnId {
        TxnId::new(id)
    }

    #[test]
    fn markers_move_unknown_only() {
        let mut ledger = Ledger::new();
        let key = ledger.key(t(4));
        ledger.observe(key, Lsn::new(1, 90));
        assert!(ledger.resolve(key, TxnStatus::Committed, TxnId::NONE));
        assert!(!ledger.resolve(key, TxnStatus::Aborted, TxnId::NONE));
        assert_eq!(ledger.find(t(4)), TxnStatus::Committed);
        assert_eq!(ledger.find(t(5)), TxnStatus::Unknown);
    }

    #[test]
    fn observe_tracks_span_and_count() {
        let mut ledger = Ledger::new();
        let key = ledger.key(t(2));
        for offset in [300, 200, 100] {
            ledger.observe(key, Lsn::new(1, offset));
        }
        let entry = ledger.get(key).unwrap();
        assert_eq!(entry.last_lsn, Lsn::new(1, 300));
        assert_eq!(entry.first_lsn, Lsn::new(1, 100));
        assert_eq!(entry.record_count, 3);
        assert_eq!(ledger.max_txnid(), t(2));
    }

    #[test]
    fn recycled_ids_get_their_own_generation() {
        let mut ledger = Ledger::new();
        // Newest use of id 1, after the recycle record.
        let new = ledger.key(t(1));
        ledger.observe(new, Lsn::new(2, 50));
        ledger.resolve(new, TxnStatus::Committed, TxnId::NONE);

        ledger.push_recycle(t(1), t(9));
        let old = ledger.key(t(1));
        assert_ne!(old, new);
        ledger.observe(old, Lsn::new(1, 10));

        assert_eq!(ledger.abort_unresolved(), 1);
        assert_eq!(ledger.status(old), TxnStatus::Aborted);
        assert_eq!(ledger.status(new), TxnStatus::Committed);
        assert_eq!(ledger.aborted(), vec![old]);

        ledger.pop_recycle();
        assert_eq!(ledger.find(t(1)), TxnStatus::Committed);
        assert_eq!(ledger.generation(t(12)), 0);
    }
}
