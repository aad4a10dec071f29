//! Live structural operations on pages.
//!
//! Each operation reads the pages it needs, logs one record through
//! [`TransactionManager::log_and_apply`](crate::txn::TransactionManager::log_and_apply)
//! and lets the record's redo handler perform the change, so a live
//! mutation and its replay take the same path. Callers hold the page locks.

mod alloc;
mod items;
mod overflow;

pub use alloc::{allocate_page, free_page, prepare_page, sort_free_list};
pub use items::{init_page, insert_item, link_page, noop, remove_item, unlink_page};
pub use overflow::{adjust_overflow_refcount, overflow_chain, put_overflow, read_overflow};

use crate::error::{CoreError, CoreResult};
use crate::page::{Page, PageType};
use crate::types::{PageNo, PGNO_INVALID, PGNO_META};
use pagelog_storage::PageStore;
use std::collections::{HashMap, HashSet};

/// Pages on the free list, head first.
///
/// # Errors
///
/// Returns [`CoreError::RecoveryInconsistency`] if the list loops or passes
/// through a page that is not free.
pub fn free_list(pages: &dyn PageStore) -> CoreResult<Vec<PageNo>> {
    walk_free_list(pages, &HashMap::new())
}

/// Walks the free list from the metadata page.
///
/// A node that is not a free page is followed through `overrides`, which
/// maps pages restored by undo to the successor they had on the list.
///
/// # Errors
///
/// Returns [`CoreError::RecoveryInconsistency`] at the metadata page LSN if
/// the list loops or reaches a non-free page without an override.
pub fn walk_free_list(
    pages: &dyn PageStore,
    overrides: &HashMap<PageNo, PageNo>,
) -> CoreResult<Vec<PageNo>> {
    let meta = Page::read(pages, PGNO_META)?;
    let mut list = Vec::new();
    let mut seen = HashSet::new();
    let mut pgno = meta.free_head();
    while pgno != PGNO_INVALID {
        if pgno == PGNO_META || !seen.insert(pgno) {
            return Err(CoreError::inconsistency(
                meta.lsn(),
                format!("free list loops at page {pgno}"),
            ));
        }
        list.push(pgno);
        let page = Page::read(pages, pgno)?;
        pgno = if page.page_type() == PageType::Free {
            page.next_pgno()
        } else if let Some(next) = overrides.get(&pgno) {
            *next
        } else {
            return Err(CoreError::inconsistency(
                meta.lsn(),
                format!("free list reaches page {pgno} of type {:?}", page.page_type()),
            ));
        };
    }
    Ok(list)
}
