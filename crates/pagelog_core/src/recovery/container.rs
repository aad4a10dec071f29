//! Named in-memory containers.
//!
//! Containers live only in memory; their create, rename and remove records
//! exist so that a transaction's container changes commit or roll back with
//! its page changes. The registry is rebuilt from the records in the
//! recovery window. This component plugs into recovery through
//! [`DispatchTable::register_kind`] like any layered component would.

use super::dispatch::{DispatchTable, ReplayContext, ReplayOp, ReplayOutcome};
use crate::error::{CoreError, CoreResult};
use crate::log::{LogRecord, RecordBody, RecordKind};
use crate::txn::{Transaction, TransactionManager};
use crate::types::Lsn;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Name to file-id map of the live containers.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    by_name: RwLock<BTreeMap<String, Uuid>>,
}

impl ContainerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// File id of the container called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Uuid> {
        self.by_name.read().get(name).copied()
    }

    /// Names of all containers, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.by_name.read().keys().cloned().collect()
    }

    /// Number of containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    /// Whether there are no containers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.read().is_empty()
    }

    fn insert(&self, name: &str, fid: Uuid) -> bool {
        let mut map = self.by_name.write();
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_owned(), fid);
        true
    }

    fn remove(&self, name: &str, fid: Uuid) -> bool {
        let mut map = self.by_name.write();
        if map.get(name) != Some(&fid) {
            return false;
        }
        map.remove(name);
        true
    }

    fn rename(&self, from: &str, to: &str, fid: Uuid) -> bool {
        let mut map = self.by_name.write();
        if map.get(from) != Some(&fid) || map.contains_key(to) {
            return false;
        }
        map.remove(from);
        map.insert(to.to_owned(), fid);
        true
    }

    /// Redo or undo of one container record. State checks make both
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedRecordKind`] for non-container
    /// records.
    pub fn replay(&self, record: &LogRecord, lsn: Lsn, op: ReplayOp) -> CoreResult<ReplayOutcome> {
        let undo = op.is_undo();
        let changed = match &record.body {
            RecordBody::InmemCreate { fid, name } => {
                let fid = Uuid::from_bytes(*fid);
                if undo {
                    self.remove(name, fid)
                } else {
                    self.insert(name, fid)
                }
            }
            RecordBody::InmemRemove { fid, name } => {
                let fid = Uuid::from_bytes(*fid);
                if undo {
                    self.insert(name, fid)
                } else {
                    self.remove(name, fid)
                }
            }
            RecordBody::InmemRename {
                fid,
                old_name,
                new_name,
            } => {
                let fid = Uuid::from_bytes(*fid);
                if undo {
                    self.rename(new_name, old_name, fid)
                } else {
                    self.rename(old_name, new_name, fid)
                }
            }
            other => {
                return Err(CoreError::UnsupportedRecordKind {
                    kind: other.code(),
                })
            }
        };
        debug!(%lsn, kind = record.name(), ?op, changed, "container record replayed");
        Ok(match (changed, undo) {
            (false, _) => ReplayOutcome::Skipped,
            (true, false) => ReplayOutcome::Applied,
            (true, true) => ReplayOutcome::Undone,
        })
    }
}

fn print_container(record: &LogRecord) -> String {
    let detail = match &record.body {
        RecordBody::InmemCreate { fid, name } | RecordBody::InmemRemove { fid, name } => {
            format!("fid: {} name: {name:?}", Uuid::from_bytes(*fid))
        }
        RecordBody::InmemRename {
            fid,
            old_name,
            new_name,
        } => format!(
            "fid: {} old_name: {old_name:?} new_name: {new_name:?}",
            Uuid::from_bytes(*fid)
        ),
        _ => String::new(),
    };
    format!(
        "[{}] {} prev_lsn: {} {detail}",
        record.name(),
        record.txnid,
        record.prev_lsn
    )
}

/// Registers the container record kinds against `registry`.
pub fn register(table: &mut DispatchTable, registry: &Arc<ContainerRegistry>) {
    for kind in [
        RecordKind::InmemCreate,
        RecordKind::InmemRename,
        RecordKind::InmemRemove,
    ] {
        let registry = Arc::clone(registry);
        table.register_kind(
            kind,
            kind.name(),
            Arc::new(
                move |_: &ReplayContext<'_>, record: &LogRecord, lsn: Lsn, op: ReplayOp| {
                    registry.replay(record, lsn, op)
                },
            ),
            Some(Arc::new(print_container)),
        );
    }
}

/// Creates a container called `name` and returns its file id.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if the name is empty or taken.
pub fn create_container(
    tm: &TransactionManager,
    registry: &ContainerRegistry,
    txn: &mut Transaction,
    name: &str,
) -> CoreResult<Uuid> {
    if name.is_empty() {
        return Err(CoreError::invalid_operation("container name is empty"));
    }
    if registry.get(name).is_some() {
        return Err(CoreError::invalid_operation(format!(
            "container {name:?} already exists"
        )));
    }
    let fid = Uuid::new_v4();
    tm.log_and_apply(
        txn,
        RecordBody::InmemCreate {
            fid: *fid.as_bytes(),
            name: name.to_owned(),
        },
    )?;
    Ok(fid)
}

/// Renames container `old_name` to `new_name`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if `old_name` does not exist or
/// `new_name` is taken.
pub fn rename_container(
    tm: &TransactionManager,
    registry: &ContainerRegistry,
    txn: &mut Transaction,
    old_name: &str,
    new_name: &str,
) -> CoreResult<()> {
    let fid = registry
        .get(old_name)
        .ok_or_else(|| CoreError::invalid_operation(format!("no container {old_name:?}")))?;
    if new_name.is_empty() || registry.get(new_name).is_some() {
        return Err(CoreError::invalid_operation(format!(
            "cannot rename {old_name:?} to {new_name:?}"
        )));
    }
    tm.log_and_apply(
        txn,
        RecordBody::InmemRename {
            fid: *fid.as_bytes(),
            old_name: old_name.to_owned(),
            new_name: new_name.to_owned(),
        },
    )?;
    Ok(())
}

/// Removes container `name` and returns the file id it had.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if it does not exist.
pub fn remove_container(
    tm: &TransactionManager,
    registry: &ContainerRegistry,
    txn: &mut Transaction,
    name: &str,
) -> CoreResult<Uuid> {
    let fid = registry
        .get(name)
        .ok_or_else(|| CoreError::invalid_operation(format!("no container {name:?}")))?;
    tm.log_and_apply(
        txn,
        RecordBody::InmemRemove {
            fid: *fid.as_bytes(),
            name: name.to_owned(),
        },
    )?;
    Ok(fid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxnId;

    fn record(body: RecordBody) -> LogRecord {
        LogRecord::new(TxnId::new(1), Lsn::ZERO, body)
    }

    #[test]
    fn create_rename_remove_round_trip_through_undo() {
        let registry = ContainerRegistry::new();
        let fid = Uuid::new_v4();
        let create = record(RecordBody::InmemCreate {
            fid: *fid.as_bytes(),
            name: "orders".into(),
        });
        let rename = record(RecordBody::InmemRename {
            fid: *fid.as_bytes(),
            old_name: "orders".into(),
            new_name: "orders_v2".into(),
        });
        let lsn = Lsn::new(1, 0);

        assert_eq!(registry.replay(&create, lsn, ReplayOp::Redo).unwrap(), ReplayOutcome::Applied);
        assert_eq!(registry.replay(&create, lsn, ReplayOp::Redo).unwrap(), ReplayOutcome::Skipped);
        registry.replay(&rename, lsn, ReplayOp::Redo).unwrap();
        assert_eq!(registry.names(), vec!["orders_v2".to_string()]);

        assert_eq!(registry.replay(&rename, lsn, ReplayOp::Undo).unwrap(), ReplayOutcome::Undone);
        assert_eq!(registry.get("orders"), Some(fid));
        registry.replay(&create, lsn, ReplayOp::Undo).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_needs_matching_fid() {
        let registry = ContainerRegistry::new();
        let fid = Uuid::new_v4();
        registry.insert("a", fid);
        let wrong = record(RecordBody::InmemRemove {
            fid: *Uuid::new_v4().as_bytes(),
            name: "a".into(),
        });
        assert_eq!(
            registry.replay(&wrong, Lsn::new(1, 0), ReplayOp::Redo).unwrap(),
            ReplayOutcome::Skipped
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registered_printer_names_the_container() {
        let registry = Arc::new(ContainerRegistry::new());
        let mut table = DispatchTable::new();
        register(&mut table, &registry);
        let body = record(RecordBody::InmemCreate {
            fid: [0; 16],
            name: "logs".into(),
        })
        .encode();
        let text = table.print(&body);
        assert!(text.starts_with("[inmem_create] txn:1"));
        assert!(text.contains("name: \"logs\""));
    }
}
