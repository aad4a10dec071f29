//! Item and sibling-link operations on single pages.

use crate::error::{CoreError, CoreResult};
use crate::log::{ItemOp, RecordBody};
use crate::page::{Item, Page};
use crate::txn::{Transaction, TransactionManager};
use crate::types::{Lsn, PageNo, PGNO_INVALID};
use pagelog_storage::PageStore;

fn slotted(pages: &dyn PageStore, pgno: PageNo) -> CoreResult<Page> {
    let page = Page::read(pages, pgno)?;
    if !page.page_type().is_slotted() {
        return Err(CoreError::invalid_operation(format!(
            "page {pgno} is a {:?} page, not a slotted page",
            page.page_type()
        )));
    }
    Ok(page)
}

/// Inserts `item` at slot `index` of `pgno`.
///
/// # Errors
///
/// Returns [`CoreError::SlotNotFound`] if `index` is past the end of the
/// slot array and [`CoreError::PageFull`] if the item does not fit. Nothing
/// is logged in either case.
pub fn insert_item(
    tm: &TransactionManager,
    txn: &mut Transaction,
    pgno: PageNo,
    index: u16,
    item: &Item,
) -> CoreResult<Lsn> {
    let page = slotted(tm.pages(), pgno)?;
    let bytes = item.encode()?;
    // Fails here, before anything is logged.
    page.clone().insert_raw(index, &bytes)?;
    tm.log_and_apply(
        txn,
        RecordBody::AddRem {
            op: ItemOp::Add,
            pgno,
            index,
            item: bytes,
            page_lsn: page.lsn(),
        },
    )
}

/// Removes and returns the item in slot `index` of `pgno`.
///
/// # Errors
///
/// Returns [`CoreError::SlotNotFound`] for a missing slot.
pub fn remove_item(
    tm: &TransactionManager,
    txn: &mut Transaction,
    pgno: PageNo,
    index: u16,
) -> CoreResult<Item> {
    let page = slotted(tm.pages(), pgno)?;
    let bytes = page.item_bytes(index)?.to_vec();
    let item = Item::decode(&bytes)?;
    tm.log_and_apply(
        txn,
        RecordBody::AddRem {
            op: ItemOp::Remove,
            pgno,
            index,
            item: bytes,
            page_lsn: page.lsn(),
        },
    )?;
    Ok(item)
}

/// Empties `pgno`, keeping its type and links.
///
/// # Errors
///
/// Returns an error if the log write fails.
pub fn init_page(tm: &TransactionManager, txn: &mut Transaction, pgno: PageNo) -> CoreResult<Lsn> {
    let page = Page::read(tm.pages(), pgno)?;
    let page_lsn = page.lsn();
    tm.log_and_apply(
        txn,
        RecordBody::PgInit {
            pgno,
            page_lsn,
            image: page.into_bytes(),
        },
    )
}

/// Advances the LSN of `pgno` without changing its contents.
///
/// # Errors
///
/// Returns an error if the log write fails.
pub fn noop(tm: &TransactionManager, txn: &mut Transaction, pgno: PageNo) -> CoreResult<Lsn> {
    let page_lsn = Page::read(tm.pages(), pgno)?.lsn();
    tm.log_and_apply(txn, RecordBody::Noop { pgno, page_lsn })
}

fn relink(
    tm: &TransactionManager,
    txn: &mut Transaction,
    add: bool,
    pgno: PageNo,
    prev_pgno: PageNo,
    next_pgno: PageNo,
) -> CoreResult<Lsn> {
    let pages = tm.pages();
    let lsn_of = |p: PageNo| -> CoreResult<Lsn> {
        if p == PGNO_INVALID {
            Ok(Lsn::ZERO)
        } else {
            Ok(Page::read(pages, p)?.lsn())
        }
    };
    tm.log_and_apply(
        txn,
        RecordBody::Relink {
            add,
            pgno,
            page_lsn: lsn_of(pgno)?,
            prev_pgno,
            prev_page_lsn: lsn_of(prev_pgno)?,
            next_pgno,
            next_page_lsn: lsn_of(next_pgno)?,
        },
    )
}

/// Links `pgno` between `prev` and `next` in a sibling chain.
///
/// # Errors
///
/// Returns an error if the log write fails.
pub fn link_page(
    tm: &TransactionManager,
    txn: &mut Transaction,
    pgno: PageNo,
    prev: PageNo,
    next: PageNo,
) -> CoreResult<Lsn> {
    relink(tm, txn, true, pgno, prev, next)
}

/// Unlinks `pgno` from its siblings, joining them to each other.
///
/// # Errors
///
/// Returns an error if the log write fails.
pub fn unlink_page(
    tm: &TransactionManager,
    txn: &mut Transaction,
    pgno: PageNo,
) -> CoreResult<Lsn> {
    let page = Page::read(tm.pages(), pgno)?;
    relink(tm, txn, false, pgno, page.prev_pgno(), page.next_pgno())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;
    use crate::ops::allocate_page;
    use crate::page::PageType;

    #[test]
    fn insert_and_remove_items() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let pgno = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        insert_item(&tm, &mut txn, pgno, 0, &Item::Data(b"b".to_vec())).unwrap();
        let lsn = insert_item(&tm, &mut txn, pgno, 0, &Item::Data(b"a".to_vec())).unwrap();

        let page = Page::read(tm.pages(), pgno).unwrap();
        assert_eq!(page.lsn(), lsn);
        assert_eq!(
            page.items().unwrap(),
            vec![Item::Data(b"a".to_vec()), Item::Data(b"b".to_vec())]
        );

        let removed = remove_item(&tm, &mut txn, pgno, 1).unwrap();
        assert_eq!(removed, Item::Data(b"b".to_vec()));
        assert_eq!(Page::read(tm.pages(), pgno).unwrap().entries(), 1);
    }

    #[test]
    fn errors_are_reported_before_logging() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let pgno = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        let count = txn.record_count();

        assert!(matches!(
            insert_item(&tm, &mut txn, pgno, 3, &Item::Data(vec![1])),
            Err(CoreError::SlotNotFound { index: 3, .. })
        ));
        assert!(matches!(
            insert_item(&tm, &mut txn, pgno, 0, &Item::Data(vec![0; 600])),
            Err(CoreError::PageFull { .. })
        ));
        assert!(matches!(
            remove_item(&tm, &mut txn, pgno, 0),
            Err(CoreError::SlotNotFound { .. })
        ));
        assert!(insert_item(&tm, &mut txn, 0, 0, &Item::Data(vec![1])).is_err());
        assert_eq!(txn.record_count(), count);
    }

    #[test]
    fn init_keeps_type() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let pgno = allocate_page(&tm, &mut txn, PageType::Internal).unwrap();
        insert_item(&tm, &mut txn, pgno, 0, &Item::Overflow { pgno: 9, tlen: 100 }).unwrap();
        init_page(&tm, &mut txn, pgno).unwrap();
        let page = Page::read(tm.pages(), pgno).unwrap();
        assert_eq!(page.page_type(), PageType::Internal);
        assert_eq!(page.entries(), 0);
    }

    #[test]
    fn noop_only_moves_lsn() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let pgno = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        let before = Page::read(tm.pages(), pgno).unwrap();
        let lsn = noop(&tm, &mut txn, pgno).unwrap();
        let after = Page::read(tm.pages(), pgno).unwrap();
        assert_eq!(after.lsn(), lsn);
        assert_eq!(&after.as_bytes()[8..], &before.as_bytes()[8..]);
    }

    #[test]
    fn link_then_unlink() {
        let tm = manager();
        let mut txn = tm.begin().unwrap();
        let a = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        let b = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        let c = allocate_page(&tm, &mut txn, PageType::Leaf).unwrap();
        link_page(&tm, &mut txn, c, PGNO_INVALID, PGNO_INVALID).unwrap();
        link_page(&tm, &mut txn, a, PGNO_INVALID, c).unwrap();
        link_page(&tm, &mut txn, b, a, c).unwrap();

        let read = |p| Page::read(tm.pages(), p).unwrap();
        assert_eq!((read(a).next_pgno(), read(b).prev_pgno(), read(b).next_pgno()), (b, a, c));
        assert_eq!(read(c).prev_pgno(), b);

        unlink_page(&tm, &mut txn, b).unwrap();
        assert_eq!(read(a).next_pgno(), c);
        assert_eq!(read(c).prev_pgno(), a);
        assert_eq!((read(b).prev_pgno(), read(b).next_pgno()), (PGNO_INVALID, PGNO_INVALID));
    }
}
