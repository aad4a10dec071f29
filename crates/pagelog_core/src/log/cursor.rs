//! Sequential scans over a [`LogSource`].

use crate::error::CoreResult;
use crate::log::manager::{LogEntry, LogSource};
use crate::types::Lsn;

/// Walks the log from an LSN towards the tail, stopping after `end`.
pub struct ForwardScan<'a> {
    log: &'a dyn LogSource,
    next: Option<Lsn>,
    end: Option<Lsn>,
}

impl<'a> ForwardScan<'a> {
    /// Scans from `from` to the current tail.
    #[must_use]
    pub fn new(log: &'a dyn LogSource, from: Lsn) -> Self {
        Self {
            log,
            next: Some(from),
            end: None,
        }
    }

    /// Stops after the record at `end`.
    #[must_use]
    pub fn until(mut self, end: Lsn) -> Self {
        self.end = Some(end);
        self
    }
}

impl Iterator for ForwardScan<'_> {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        if self.end.is_some_and(|end| lsn > end) {
            return None;
        }
        match self.log.read_at(lsn) {
            Ok(Some(entry)) => {
                self.next = entry.next;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Walks the log from an LSN towards the head, stopping at `floor`.
pub struct BackwardScan<'a> {
    log: &'a dyn LogSource,
    next: Option<Lsn>,
    floor: Lsn,
}

impl<'a> BackwardScan<'a> {
    /// Scans from `from` down to the first record.
    #[must_use]
    pub fn new(log: &'a dyn LogSource, from: Lsn) -> Self {
        Self {
            log,
            next: Some(from),
            floor: Lsn::ZERO,
        }
    }

    /// Starts at the tail; empty if the log is.
    ///
    /// # Errors
    ///
    /// Returns an error if the tail cannot be determined.
    pub fn from_tail(log: &'a dyn LogSource) -> CoreResult<Self> {
        Ok(Self {
            log,
            next: log.last_lsn()?,
            floor: Lsn::ZERO,
        })
    }

    /// Stops after the record at `floor`.
    #[must_use]
    pub fn down_to(mut self, floor: Lsn) -> Self {
        self.floor = floor;
        self
    }
}

impl Iterator for BackwardScan<'_> {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        if lsn < self.floor {
            return None;
        }
        match self.log.read_at(lsn) {
            Ok(Some(entry)) => {
                self.next = entry.prev;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogManager, LogRecord, RecordBody};
    use crate::types::TxnId;

    fn filled(n: u32) -> (LogManager, Vec<Lsn>) {
        let log = LogManager::in_memory(256).unwrap();
        let lsns = (0..n)
            .map(|i| {
                log.append(&LogRecord::new(
                    TxnId::new(1),
                    Lsn::ZERO,
                    RecordBody::PgPrepare { pgno: i },
                ))
                .unwrap()
            })
            .collect();
        (log, lsns)
    }

    #[test]
    fn forward_and_backward_agree_across_files() {
        let (log, lsns) = filled(20);
        assert!(log.file_numbers().len() > 1);
        let forward: Vec<Lsn> = ForwardScan::new(&log, lsns[0]).map(|e| e.unwrap().lsn).collect();
        let mut backward: Vec<Lsn> = BackwardScan::from_tail(&log)
            .unwrap()
            .map(|e| e.unwrap().lsn)
            .collect();
        backward.reverse();
        assert_eq!(forward, lsns);
        assert_eq!(backward, lsns);
    }

    #[test]
    fn bounds_are_inclusive() {
        let (log, lsns) = filled(6);
        let window: Vec<Lsn> = ForwardScan::new(&log, lsns[1])
            .until(lsns[3])
            .map(|e| e.unwrap().lsn)
            .collect();
        assert_eq!(window, lsns[1..=3].to_vec());
        let tail: Vec<Lsn> = BackwardScan::new(&log, lsns[5])
            .down_to(lsns[4])
            .map(|e| e.unwrap().lsn)
            .collect();
        assert_eq!(tail, vec![lsns[5], lsns[4]]);
    }

    #[test]
    fn empty_log_scans_nothing() {
        let log = LogManager::in_memory(256).unwrap();
        assert_eq!(BackwardScan::from_tail(&log).unwrap().count(), 0);
    }
}
