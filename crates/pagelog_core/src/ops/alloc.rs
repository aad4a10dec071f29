//! Page allocation and the free list.

use super::free_list;
use crate::error::{CoreError, CoreResult};
use crate::log::RecordBody;
use crate::page::{Page, PageType};
use crate::txn::{Transaction, TransactionManager};
use crate::types::{Lsn, PageNo, PGNO_INVALID, PGNO_META};
use std::collections::HashSet;
use tracing::debug;

/// Takes a page off the free list, or extends the file when the list is
/// empty, and initializes it to `ptype`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] for an unused `ptype` or an
/// error from the log or page store.
pub fn allocate_page(
    tm: &TransactionManager,
    txn: &mut Transaction,
    ptype: PageType,
) -> CoreResult<PageNo> {
    if ptype.is_unused() || ptype == PageType::Meta {
        return Err(CoreError::invalid_operation(format!(
            "cannot allocate a page of type {ptype:?}"
        )));
    }
    let pages = tm.pages();
    let meta = Page::read(pages, PGNO_META)?;
    let head = meta.free_head();
    let (pgno, next) = if head == PGNO_INVALID {
        let last = meta.last_pgno();
        let pgno = last
            .checked_add(1)
            .ok_or_else(|| CoreError::invalid_operation("page numbers exhausted"))?;
        (pgno, PGNO_INVALID)
    } else {
        let page = Page::read(pages, head)?;
        if page.page_type() != PageType::Free {
            return Err(CoreError::inconsistency(
                meta.lsn(),
                format!("free list head {head} is a {:?} page", page.page_type()),
            ));
        }
        (head, page.next_pgno())
    };
    let page = Page::read(pages, pgno)?;

    tm.log_and_apply(
        txn,
        RecordBody::PgAlloc {
            meta_lsn: meta.lsn(),
            page_lsn: page.lsn(),
            pgno,
            ptype,
            next,
            last_pgno: meta.last_pgno(),
            prev_free: PGNO_INVALID,
            prev_free_lsn: Lsn::ZERO,
            header: page.header().to_vec(),
        },
    )?;
    debug!(txn = %txn.id(), pgno, ?ptype, "page allocated");
    Ok(pgno)
}

/// Pushes `pgno` on the free list head.
///
/// A page that still holds items or overflow data is logged in full so
/// undo can bring it back.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] for the metadata page or a page
/// that is already free.
pub fn free_page(tm: &TransactionManager, txn: &mut Transaction, pgno: PageNo) -> CoreResult<()> {
    if pgno == PGNO_META {
        return Err(CoreError::invalid_operation("cannot free the metadata page"));
    }
    let pages = tm.pages();
    let meta = Page::read(pages, PGNO_META)?;
    if pgno > meta.last_pgno() {
        return Err(CoreError::invalid_operation(format!(
            "page {pgno} is past the last page {}",
            meta.last_pgno()
        )));
    }
    let page = Page::read(pages, pgno)?;
    if page.page_type() == PageType::Free {
        return Err(CoreError::invalid_operation(format!("page {pgno} is already free")));
    }

    let (meta_lsn, page_lsn, next, last_pgno) =
        (meta.lsn(), page.lsn(), meta.free_head(), meta.last_pgno());
    let body = if page.holds_data() {
        RecordBody::PgFreeData {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
            image: page.into_bytes(),
        }
    } else {
        RecordBody::PgFree {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
            header: page.header().to_vec(),
        }
    };
    tm.log_and_apply(txn, body)?;
    debug!(txn = %txn.id(), pgno, "page freed");
    Ok(())
}

/// Sorts the free list ascending and drops the free pages at the end of
/// the file. Returns how many pages were dropped.
///
/// Nothing is logged when the list is empty.
///
/// # Errors
///
/// Returns an error if the free list is damaged or the log write fails.
pub fn sort_free_list(tm: &TransactionManager, txn: &mut Transaction) -> CoreResult<usize> {
    let pages = tm.pages();
    let list = free_list(pages)?;
    if list.is_empty() {
        return Ok(0);
    }
    let meta = Page::read(pages, PGNO_META)?;
    let members: HashSet<PageNo> = list.iter().copied().collect();
    let mut new_last = meta.last_pgno();
    while new_last != PGNO_META && members.contains(&new_last) {
        new_last -= 1;
    }

    let mut free = Vec::with_capacity(list.len());
    for pgno in &list {
        free.push((*pgno, Page::read(pages, *pgno)?.lsn()));
    }
    let dropped = list.iter().filter(|pgno| **pgno > new_last).count();
    tm.log_and_apply(
        txn,
        RecordBody::PgSort {
            meta_lsn: meta.lsn(),
            last_pgno: meta.last_pgno(),
            new_last_pgno: new_last,
            free,
        },
    )?;
    debug!(txn = %txn.id(), pages = list.len(), dropped, new_last, "free list sorted");
    Ok(dropped)
}

/// Records that a prepared transaction holds `pgno`.
///
/// # Errors
///
/// Returns an error if the log write fails.
pub fn prepare_page(
    tm: &TransactionManager,
    txn: &mut Transaction,
    pgno: PageNo,
) -> CoreResult<Lsn> {
    tm.log_and_apply(txn, RecordBody::PgPrepare { pgno })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{manager, SIZE};
    use super::*;
    use crate::log::LogSource;
    use crate::ops::insert_item;
    use crate::page::Item;

    #[test]
    fn empty_list_extends_the_file() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        assert_eq!(allocate_page(&tm, &mut txn, PageType::Leaf).unwrap(), 1);
        assert_eq!(allocate_page(&tm, &mut txn, PageType::Overflow).unwrap(), 2);
        let meta = Page::read(tm.pages(), 0).unwrap();
        assert_eq!(meta.last_pgno(), 2);
        assert_eq!(meta.free_head(), PGNO_INVALID);
        let page = Page::read(tm.pages(), 2).unwrap();
        assert_eq!(page.page_type(), PageType::Overflow);
        assert_eq!(page.pgno(), 2);
        assert_eq!(page.lsn(), txn.last_lsn());
    }

    #[test]
    fn freed_page_is_reused_first() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let a = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        let b = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        free_page(&tm, &mut txn, a).unwrap();
        free_page(&tm, &mut txn, b).unwrap();
        assert_eq!(free_list(tm.pages()).unwrap(), vec![b, a]);
        assert_eq!(allocate_page(&tm, &mut txn, PageType::Internal).unwrap(), b);
        assert_eq!(free_list(tm.pages()).unwrap(), vec![a]);
        assert!(free_page(&tm, &mut txn, a).is_err());
        assert!(free_page(&tm, &mut txn, PGNO_META).is_err());
    }

    #[test]
    fn page_with_items_logged_in_full() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let pgno = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        insert_item(&tm, &mut txn, pgno, 0, &Item::Data(b"kept".to_vec())).unwrap();
        free_page(&tm, &mut txn, pgno).unwrap();
        let record = tm
            .log()
            .read_at(txn.last_lsn())
            .unwrap()
            .unwrap()
            .record()
            .unwrap();
        assert!(matches!(record.body, RecordBody::PgFreeData { ref image, .. } if image.len() == SIZE));
        assert_eq!(Page::read(tm.pages(), pgno).unwrap().page_type(), PageType::Free);
    }

    #[test]
    fn sort_drops_trailing_pages() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        for _ in 0..5 {
            allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        }
        for pgno in [2, 5, 4] {
            free_page(&tm, &mut txn, pgno).unwrap();
        }
        assert_eq!(free_list(tm.pages()).unwrap(), vec![4, 5, 2]);
        assert_eq!(sort_free_list(&tm, &mut txn).unwrap(), 2);
        assert_eq!(free_list(tm.pages()).unwrap(), vec![2]);
        let meta = Page::read(tm.pages(), 0).unwrap();
        assert_eq!(meta.last_pgno(), 3);
        assert_eq!(Page::read(tm.pages(), 5).unwrap().page_type(), PageType::Invalid);
    }

    #[test]
    fn sort_of_empty_list_logs_nothing() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        assert_eq!(sort_free_list(&tm, &mut txn).unwrap(), 0);
        assert_eq!(txn.record_count(), 0);
    }
}
