//! Property-based test generators using proptest.
//!
//! Record strategies produce well-formed records of the current kinds.
//! Workload strategies produce transaction scripts that
//! [`run_script`] plays against an environment.

use pagelog_core::log::{ItemOp, RegopOp};
use pagelog_core::{
    CoreError, CoreResult, Environment, Item, LogRecord, Lsn, PageNo, PageType, RecordBody, TxnId,
};
use proptest::prelude::*;

/// Strategy for LSNs of real records.
pub fn lsn_strategy() -> impl Strategy<Value = Lsn> {
    (1u32..8, 0u32..(1 << 20)).prop_map(|(file, offset)| Lsn::new(file, offset))
}

/// Strategy for transaction ids, including [`TxnId::NONE`].
pub fn txnid_strategy() -> impl Strategy<Value = TxnId> {
    prop_oneof![Just(TxnId::NONE), (1u32..10_000).prop_map(TxnId::new)]
}

/// Strategy for page types a page can be allocated as.
pub fn page_type_strategy() -> impl Strategy<Value = PageType> {
    prop_oneof![
        Just(PageType::Leaf),
        Just(PageType::Internal),
        Just(PageType::Overflow),
    ]
}

/// Strategy for slotted-page items.
pub fn item_strategy() -> impl Strategy<Value = Item> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Item::Data),
        (1u32..1000, any::<u32>()).prop_map(|(pgno, tlen)| Item::Overflow { pgno, tlen }),
    ]
}

fn pgno() -> impl Strategy<Value = PageNo> {
    0u32..64
}

fn bytes(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..max)
}

fn item_op() -> impl Strategy<Value = ItemOp> {
    prop_oneof![Just(ItemOp::Add), Just(ItemOp::Remove)]
}

/// Strategy for record bodies of the kinds live code writes.
pub fn record_body_strategy() -> impl Strategy<Value = RecordBody> {
    prop_oneof![page_body_strategy(), marker_body_strategy()]
}

fn page_body_strategy() -> impl Strategy<Value = RecordBody> {
    prop_oneof![
        (item_op(), pgno(), any::<u16>(), bytes(48), lsn_strategy()).prop_map(
            |(op, pgno, index, item, page_lsn)| RecordBody::AddRem {
                op,
                pgno,
                index,
                item,
                page_lsn,
            }
        ),
        (item_op(), pgno(), pgno(), pgno(), bytes(128), lsn_strategy()).prop_map(
            |(op, pgno, prev_pgno, next_pgno, data, page_lsn)| RecordBody::Big {
                op,
                pgno,
                prev_pgno,
                next_pgno,
                data,
                page_lsn,
            }
        ),
        (pgno(), -3i32..4, lsn_strategy()).prop_map(|(pgno, adjust, page_lsn)| RecordBody::OvRef {
            pgno,
            adjust,
            page_lsn,
        }),
        (lsn_strategy(), pgno(), page_type_strategy(), pgno(), pgno(), bytes(32)).prop_map(
            |(meta_lsn, pgno, ptype, next, last_pgno, header)| RecordBody::PgAlloc {
                meta_lsn,
                page_lsn: meta_lsn,
                pgno,
                ptype,
                next,
                last_pgno,
                prev_free: 0,
                prev_free_lsn: Lsn::ZERO,
                header,
            }
        ),
        (lsn_strategy(), pgno(), pgno(), pgno(), bytes(32)).prop_map(
            |(meta_lsn, pgno, next, last_pgno, header)| RecordBody::PgFree {
                meta_lsn,
                page_lsn: meta_lsn,
                pgno,
                next,
                last_pgno,
                header,
            }
        ),
        (lsn_strategy(), pgno(), pgno(), prop::collection::vec((pgno(), lsn_strategy()), 0..6)).prop_map(
            |(meta_lsn, last_pgno, new_last_pgno, free)| RecordBody::PgSort {
                meta_lsn,
                last_pgno,
                new_last_pgno,
                free,
            }
        ),
    ]
}

fn marker_body_strategy() -> impl Strategy<Value = RecordBody> {
    prop_oneof![
        (pgno(), lsn_strategy()).prop_map(|(pgno, page_lsn)| RecordBody::Noop { pgno, page_lsn }),
        (bytes(8), bytes(8), bytes(8), any::<u32>()).prop_map(|(op, key, data, flags)| {
            RecordBody::Debug { op, key, data, flags }
        }),
        (any::<bool>(), any::<u64>(), txnid_strategy()).prop_map(|(commit, timestamp, parent)| {
            RecordBody::TxnRegop {
                op: if commit { RegopOp::Commit } else { RegopOp::Abort },
                timestamp,
                parent,
            }
        }),
        (lsn_strategy(), any::<u64>(), txnid_strategy()).prop_map(|(ckp_lsn, timestamp, next_txnid)| {
            RecordBody::TxnCheckpoint {
                ckp_lsn,
                last_ckp: Lsn::ZERO,
                timestamp,
                next_txnid,
            }
        }),
        (any::<[u8; 16]>(), "[a-z]{1,12}").prop_map(|(fid, name)| RecordBody::InmemCreate { fid, name }),
        Just(RecordBody::Cksum),
    ]
}

/// Strategy for complete records.
pub fn log_record_strategy() -> impl Strategy<Value = LogRecord> {
    (txnid_strategy(), prop_oneof![Just(Lsn::ZERO), lsn_strategy()], record_body_strategy())
        .prop_map(|(txnid, prev_lsn, body)| LogRecord::new(txnid, prev_lsn, body))
}

/// One step of a transaction script.
#[derive(Debug, Clone)]
pub enum Step {
    /// Allocate a page of the given type.
    Allocate(PageType),
    /// Append an item to one of the pages this script allocated.
    Insert {
        /// Which owned page, modulo the number owned.
        page: usize,
        /// Inline data.
        data: Vec<u8>,
    },
    /// Remove the first item of an owned page, if any.
    Remove {
        /// Which owned page, modulo the number owned.
        page: usize,
    },
    /// Free an owned page.
    Free {
        /// Which owned page, modulo the number owned.
        page: usize,
    },
    /// Write an overflow value and optionally drop its only reference.
    Overflow {
        /// Value length.
        len: usize,
        /// Whether to release the chain again.
        release: bool,
    },
}

/// How a script ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Commit.
    Commit,
    /// Abort at run time.
    Abort,
    /// Leave the transaction open, to be cut off by a crash.
    Open,
}

/// A transaction's worth of steps.
#[derive(Debug, Clone)]
pub struct Script {
    /// Steps in order.
    pub steps: Vec<Step>,
    /// How the transaction ends.
    pub outcome: Outcome,
}

/// Strategy for a single step.
pub fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => prop_oneof![Just(PageType::Leaf), Just(PageType::Internal)].prop_map(Step::Allocate),
        4 => (any::<usize>(), bytes(40)).prop_map(|(page, data)| Step::Insert { page, data }),
        1 => any::<usize>().prop_map(|page| Step::Remove { page }),
        1 => any::<usize>().prop_map(|page| Step::Free { page }),
        1 => (1usize..1500, any::<bool>()).prop_map(|(len, release)| Step::Overflow { len, release }),
    ]
}

/// Strategy for a script ending in commit or abort.
pub fn script_strategy() -> impl Strategy<Value = Script> {
    (
        prop::collection::vec(step_strategy(), 1..12),
        prop_oneof![3 => Just(Outcome::Commit), 1 => Just(Outcome::Abort)],
    )
        .prop_map(|(steps, outcome)| Script { steps, outcome })
}

/// Strategy for a workload: finished scripts, then one left open.
pub fn workload_strategy() -> impl Strategy<Value = Vec<Script>> {
    (
        prop::collection::vec(script_strategy(), 1..6),
        prop::collection::vec(step_strategy(), 0..8),
    )
        .prop_map(|(mut scripts, tail)| {
            scripts.push(Script {
                steps: tail,
                outcome: Outcome::Open,
            });
            scripts
        })
}

/// Plays `script` in a new transaction. Steps that cannot apply (no owned
/// page, full page, empty page) are skipped.
///
/// # Errors
///
/// Returns any other error from the environment.
pub fn run_script(env: &Environment, script: &Script) -> CoreResult<()> {
    let mut txn = env.begin()?;
    let mut owned: Vec<PageNo> = Vec::new();
    for step in &script.steps {
        match step {
            Step::Allocate(ptype) => owned.push(env.allocate_page(&mut txn, *ptype)?),
            Step::Insert { page, data } if !owned.is_empty() => {
                let pgno = owned[page % owned.len()];
                let entries = env.read_page(pgno)?.entries();
                match env.insert_item(&mut txn, pgno, entries, &Item::Data(data.clone())) {
                    Ok(_) | Err(CoreError::PageFull { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Step::Remove { page } if !owned.is_empty() => {
                let pgno = owned[page % owned.len()];
                if env.read_page(pgno)?.entries() > 0 {
                    env.remove_item(&mut txn, pgno, 0)?;
                }
            }
            Step::Free { page } if !owned.is_empty() => {
                let pgno = owned.remove(page % owned.len());
                env.free_page(&mut txn, pgno)?;
            }
            Step::Overflow { len, release } => {
                let data: Vec<u8> = (0..*len).map(|i| (i % 253) as u8).collect();
                let head = env.put_overflow(&mut txn, &data)?;
                if *release {
                    env.adjust_overflow_refcount(&mut txn, head, -1)?;
                }
            }
            _ => {}
        }
    }
    match script.outcome {
        Outcome::Commit => {
            env.commit(&mut txn)?;
        }
        Outcome::Abort => {
            env.abort(&mut txn)?;
        }
        Outcome::Open => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEnv;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn generated_records_encode(record in log_record_strategy()) {
            let bytes = record.encode();
            prop_assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
        }

        #[test]
        fn scripts_run(script in script_strategy()) {
            let env = TestEnv::memory();
            run_script(&env, &script).unwrap();
            prop_assert_eq!(env.txn_manager().active_count(), 0);
        }
    }
}
