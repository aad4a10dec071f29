//! Pages allocated or freed by transactions that did not commit.
//!
//! Undo restores page contents, but the free list can still disagree with
//! them: a page allocated by an aborted transaction may be off the list and
//! in nobody's use, and a page it freed may still sit on the list. After the
//! ledger is complete each such page is checked against the actual list and
//! a compensating allocation or free is logged.

use super::ledger::TxnKey;
use crate::error::CoreResult;
use crate::log::RecordBody;
use crate::ops::walk_free_list;
use crate::page::{Page, PageType};
use crate::types::{Lsn, PageNo, PGNO_INVALID, PGNO_META};
use pagelog_storage::PageStore;
use std::collections::HashMap;
use tracing::debug;

/// Offset of the type byte in a page header image.
const HEADER_TYPE_OFFSET: usize = 24;

/// Which way the uncommitted transaction moved the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimboFlavor {
    /// Taken off the free list (or past the end of the file).
    Allocated,
    /// Put on the free list.
    Freed,
}

/// A page whose free-list membership is in doubt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimboEntry {
    /// Owning transaction.
    pub key: TxnKey,
    /// The page.
    pub pgno: PageNo,
    /// Earliest record of the transaction that moved the page.
    pub lsn: Lsn,
    /// Direction of the move.
    pub flavor: LimboFlavor,
    /// For `Freed`: the list successor recorded when the page was freed.
    pub next: PageNo,
    /// For `Freed`: the page's type before it was freed.
    pub ptype: PageType,
}

/// Limbo entries, at most one per transaction and page.
#[derive(Debug, Default)]
pub struct Limbo {
    entries: HashMap<(TxnKey, PageNo), LimboEntry>,
}

fn type_in_image(image: &[u8]) -> PageType {
    image
        .get(HEADER_TYPE_OFFSET)
        .and_then(|b| PageType::from_u8(*b))
        .unwrap_or(PageType::Invalid)
}

impl Limbo {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes the record at `lsn` if it allocates or frees a page. Returns
    /// whether it did.
    pub fn note(&mut self, key: TxnKey, lsn: Lsn, body: &RecordBody) -> bool {
        let (pgno, flavor, next, ptype) = match body {
            RecordBody::PgAlloc { pgno, .. }
            | RecordBody::PgNew { pgno, .. }
            | RecordBody::PgPrepare { pgno } => {
                (*pgno, LimboFlavor::Allocated, PGNO_INVALID, PageType::Invalid)
            }
            RecordBody::PgFree {
                pgno, next, header, ..
            } => (*pgno, LimboFlavor::Freed, *next, type_in_image(header)),
            RecordBody::PgFreeData {
                pgno, next, image, ..
            } => (*pgno, LimboFlavor::Freed, *next, type_in_image(image)),
            _ => return false,
        };
        if pgno == PGNO_META {
            return false;
        }
        let entry = LimboEntry {
            key,
            pgno,
            lsn,
            flavor,
            next,
            ptype,
        };
        self.entries
            .entry((key, pgno))
            .and_modify(|existing| {
                if lsn < existing.lsn {
                    *existing = entry.clone();
                }
            })
            .or_insert(entry);
        true
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose transaction satisfies `keep`, newest first.
    #[must_use]
    pub fn pending<F>(&self, keep: F) -> Vec<LimboEntry>
    where
        F: Fn(TxnKey) -> bool,
    {
        let mut pending: Vec<LimboEntry> = self
            .entries
            .values()
            .filter(|entry| keep(entry.key))
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.lsn.cmp(&a.lsn));
        pending
    }

    /// Brings the free list in line with every entry accepted by `keep`,
    /// newest first. Each compensating record is handed to `log`, which
    /// must log it and apply it before returning. Returns the number of
    /// records logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the free list cannot be walked or `log` fails.
    pub fn resolve<F>(
        &self,
        pages: &dyn PageStore,
        keep: F,
        log: &mut dyn FnMut(RecordBody) -> CoreResult<()>,
    ) -> CoreResult<usize>
    where
        F: Fn(TxnKey) -> bool,
    {
        let pending = self.pending(keep);
        let overrides: HashMap<PageNo, PageNo> = pending
            .iter()
            .filter(|entry| entry.flavor == LimboFlavor::Freed)
            .map(|entry| (entry.pgno, entry.next))
            .collect();

        let mut logged = 0;
        for entry in &pending {
            let meta = Page::read(pages, PGNO_META)?;
            let list = walk_free_list(pages, &overrides)?;
            let position = list.iter().position(|p| *p == entry.pgno);
            let page = Page::read(pages, entry.pgno)?;

            let body = match (entry.flavor, position) {
                (LimboFlavor::Freed, Some(i)) => {
                    let prev_free = if i == 0 { PGNO_INVALID } else { list[i - 1] };
                    let prev_free_lsn = if prev_free == PGNO_INVALID {
                        Lsn::ZERO
                    } else {
                        Page::read(pages, prev_free)?.lsn()
                    };
                    RecordBody::PgAlloc {
                        meta_lsn: meta.lsn(),
                        page_lsn: page.lsn(),
                        pgno: entry.pgno,
                        ptype: entry.ptype,
                        next: list.get(i + 1).copied().unwrap_or(PGNO_INVALID),
                        last_pgno: meta.last_pgno(),
                        prev_free,
                        prev_free_lsn,
                        header: page.header().to_vec(),
                    }
                }
                (LimboFlavor::Allocated, None) if entry.pgno > meta.last_pgno() => {
                    RecordBody::PgNew {
                        meta_lsn: meta.lsn(),
                        page_lsn: page.lsn(),
                        pgno: entry.pgno,
                        next: meta.free_head(),
                        last_pgno: meta.last_pgno(),
                    }
                }
                (LimboFlavor::Allocated, None) if page.holds_data() => {
                    RecordBody::PgFreeData {
                        meta_lsn: meta.lsn(),
                        page_lsn: page.lsn(),
                        pgno: entry.pgno,
                        next: meta.free_head(),
                        last_pgno: meta.last_pgno(),
                        image: page.as_bytes().to_vec(),
                    }
                }
                (LimboFlavor::Allocated, None) => RecordBody::PgFree {
                    meta_lsn: meta.lsn(),
                    page_lsn: page.lsn(),
                    pgno: entry.pgno,
                    next: meta.free_head(),
                    last_pgno: meta.last_pgno(),
                    header: page.header().to_vec(),
                },
                _ => continue,
            };
            debug!(
                txn = %entry.key,
                pgno = entry.pgno,
                flavor = ?entry.flavor,
                kind = body.name(),
                "limbo page resolved"
            );
            log(body)?;
            logged += 1;
        }
        Ok(logged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogRecord;
    use crate::recovery::dispatch::{ReplayContext, ReplayOp};
    use crate::recovery::handlers::recover_core;
    use crate::types::TxnId;
    use pagelog_storage::MemoryPageStore;

    const SIZE: usize = 512;

    fn key(id: u32) -> TxnKey {
        TxnKey {
            txnid: TxnId::new(id),
            generation: 0,
        }
    }

    fn setup(last: PageNo, free: &[PageNo]) -> MemoryPageStore {
        let store = MemoryPageStore::new(SIZE);
        let mut meta = Page::new_meta(SIZE);
        meta.set_last_pgno(last);
        meta.set_free_head(free.first().copied().unwrap_or(PGNO_INVALID));
        store.write_page(0, meta.as_bytes()).unwrap();
        for (i, pgno) in free.iter().enumerate() {
            let next = free.get(i + 1).copied().unwrap_or(PGNO_INVALID);
            store.write_page(*pgno, Page::new_free(*pgno, SIZE, next).as_bytes()).unwrap();
        }
        store
    }

    fn apply_all(store: &MemoryPageStore, limbo: &Limbo) -> Vec<RecordBody> {
        let mut logged = Vec::new();
        let mut offset = 1000;
        limbo
            .resolve(store, |_| true, &mut |body| {
                let ctx = ReplayContext {
                    pages: store,
                    catastrophic: false,
                };
                let record = LogRecord::new(TxnId::new(99), Lsn::ZERO, body.clone());
                recover_core(&ctx, &record, Lsn::new(5, offset), ReplayOp::Redo)?;
                offset += 100;
                logged.push(body);
                Ok(())
            })
            .unwrap();
        logged
    }

    #[test]
    fn earliest_record_wins() {
        let mut limbo = Limbo::new();
        let alloc = RecordBody::PgPrepare { pgno: 4 };
        let free = RecordBody::PgFree {
            meta_lsn: Lsn::ZERO,
            page_lsn: Lsn::ZERO,
            pgno: 4,
            next: PGNO_INVALID,
            last_pgno: 4,
            header: Vec::new(),
        };
        // Backward scan: the free is seen first.
        assert!(limbo.note(key(1), Lsn::new(1, 200), &free));
        assert!(limbo.note(key(1), Lsn::new(1, 100), &alloc));
        assert!(!limbo.note(key(1), Lsn::new(1, 50), &RecordBody::Cksum));
        let pending = limbo.pending(|_| true);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flavor, LimboFlavor::Allocated);
        assert_eq!(pending[0].lsn, Lsn::new(1, 100));
    }

    #[test]
    fn allocated_page_goes_back_on_the_list() {
        let store = setup(3, &[2]);
        store.write_page(3, Page::new(3, SIZE, PageType::Leaf).as_bytes()).unwrap();
        let mut limbo = Limbo::new();
        limbo.note(key(1), Lsn::new(1, 10), &RecordBody::PgPrepare { pgno: 3 });

        let logged = apply_all(&store, &limbo);
        assert!(matches!(logged[..], [RecordBody::PgFree { pgno: 3, next: 2, .. }]));
        assert_eq!(walk_free_list(&store, &HashMap::new()).unwrap(), vec![3, 2]);

        // Already on the list: nothing to do.
        assert!(apply_all(&store, &limbo).is_empty());
    }

    #[test]
    fn allocation_past_the_end_uses_pg_new() {
        let store = setup(2, &[]);
        let mut limbo = Limbo::new();
        limbo.note(key(1), Lsn::new(1, 10), &RecordBody::PgPrepare { pgno: 5 });
        let logged = apply_all(&store, &limbo);
        assert!(matches!(logged[..], [RecordBody::PgNew { pgno: 5, .. }]));
        let meta = Page::read(&store, 0).unwrap();
        assert_eq!(meta.last_pgno(), 5);
        assert_eq!(meta.free_head(), 5);
    }

    #[test]
    fn freed_page_is_unlinked_from_the_middle() {
        let store = setup(6, &[2, 4, 6]);
        let mut limbo = Limbo::new();
        let header = Page::new(4, SIZE, PageType::Leaf).header().to_vec();
        limbo.note(
            key(1),
            Lsn::new(1, 10),
            &RecordBody::PgFree {
                meta_lsn: Lsn::ZERO,
                page_lsn: Lsn::ZERO,
                pgno: 4,
                next: 6,
                last_pgno: 6,
                header,
            },
        );
        let logged = apply_all(&store, &limbo);
        assert!(matches!(
            logged[..],
            [RecordBody::PgAlloc {
                pgno: 4,
                prev_free: 2,
                next: 6,
                ptype: PageType::Leaf,
                ..
            }]
        ));
        assert_eq!(walk_free_list(&store, &HashMap::new()).unwrap(), vec![2, 6]);
        assert_eq!(Page::read(&store, 4).unwrap().page_type(), PageType::Leaf);
    }

    #[test]
    fn restored_page_still_linked_is_walked_through_its_record() {
        // Page 4 got its leaf header back but the meta page still points at it.
        let store = setup(6, &[6]);
        let mut meta = Page::read(&store, 0).unwrap();
        meta.set_free_head(4);
        store.write_page(0, meta.as_bytes()).unwrap();
        let mut leaf = Page::new(4, SIZE, PageType::Leaf);
        leaf.insert_raw(0, &crate::page::Item::Data(b"v".to_vec()).encode().unwrap())
            .unwrap();
        store.write_page(4, leaf.as_bytes()).unwrap();

        let mut limbo = Limbo::new();
        limbo.note(
            key(1),
            Lsn::new(1, 10),
            &RecordBody::PgFreeData {
                meta_lsn: Lsn::ZERO,
                page_lsn: Lsn::ZERO,
                pgno: 4,
                next: 6,
                last_pgno: 6,
                image: leaf.as_bytes().to_vec(),
            },
        );
        apply_all(&store, &limbo);
        assert_eq!(walk_free_list(&store, &HashMap::new()).unwrap(), vec![6]);
        let page = Page::read(&store, 4).unwrap();
        assert_eq!(page.item(0).unwrap(), crate::page::Item::Data(b"v".to_vec()));
    }
}
