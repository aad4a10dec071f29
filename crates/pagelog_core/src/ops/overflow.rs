//! Overflow chains: values too large for a slotted page, stored across
//! singly linked overflow pages. The head page's entry count is the
//! chain's reference count.

use super::alloc::{allocate_page, free_page};
use crate::error::{CoreError, CoreResult};
use crate::log::{ItemOp, RecordBody};
use crate::page::{Page, PageType};
use crate::txn::{Transaction, TransactionManager};
use crate::types::{PageNo, PGNO_INVALID};
use pagelog_storage::PageStore;
use std::collections::HashSet;
use tracing::debug;

/// Writes `data` to a new overflow chain with reference count 1 and
/// returns its head.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] for empty data.
pub fn put_overflow(
    tm: &TransactionManager,
    txn: &mut Transaction,
    data: &[u8],
) -> CoreResult<PageNo> {
    if data.is_empty() {
        return Err(CoreError::invalid_operation("overflow value is empty"));
    }
    let chunks: Vec<&[u8]> = data.chunks(Page::overflow_capacity(tm.pages().page_size())).collect();
    let mut chain = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        chain.push(allocate_page(tm, txn, PageType::Overflow)?);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let pgno = chain[i];
        let prev_pgno = if i == 0 { PGNO_INVALID } else { chain[i - 1] };
        let next_pgno = chain.get(i + 1).copied().unwrap_or(PGNO_INVALID);
        let page_lsn = Page::read(tm.pages(), pgno)?.lsn();
        tm.log_and_apply(
            txn,
            RecordBody::Big {
                op: ItemOp::Add,
                pgno,
                prev_pgno,
                next_pgno,
                data: chunk.to_vec(),
                page_lsn,
            },
        )?;
    }
    debug!(
        txn = %txn.id(),
        head = chain[0],
        pages = chain.len(),
        len = data.len(),
        "overflow chain written"
    );
    Ok(chain[0])
}

/// Page numbers of the chain starting at `head`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if a page in the chain is not an
/// overflow page or the chain loops.
pub fn overflow_chain(pages: &dyn PageStore, head: PageNo) -> CoreResult<Vec<PageNo>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut pgno = head;
    while pgno != PGNO_INVALID {
        if !seen.insert(pgno) {
            return Err(CoreError::invalid_operation(format!(
                "overflow chain at {head} loops at page {pgno}"
            )));
        }
        let page = Page::read(pages, pgno)?;
        if page.page_type() != PageType::Overflow {
            return Err(CoreError::invalid_operation(format!(
                "page {pgno} in chain {head} is a {:?} page",
                page.page_type()
            )));
        }
        chain.push(pgno);
        pgno = page.next_pgno();
    }
    Ok(chain)
}

/// Reads the value stored in the chain starting at `head`.
///
/// # Errors
///
/// Returns an error if the chain is damaged.
pub fn read_overflow(pages: &dyn PageStore, head: PageNo) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    for pgno in overflow_chain(pages, head)? {
        out.extend_from_slice(Page::read(pages, pgno)?.overflow_data());
    }
    Ok(out)
}

/// Changes the reference count of the chain at `head` by `delta` and
/// returns the new count.
///
/// When the count reaches zero every page of the chain is emptied and
/// freed, each exactly once.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if the count would leave the
/// range of a `u16`.
pub fn adjust_overflow_refcount(
    tm: &TransactionManager,
    txn: &mut Transaction,
    head: PageNo,
    delta: i32,
) -> CoreResult<u16> {
    let pages = tm.pages();
    let page = Page::read(pages, head)?;
    if page.page_type() != PageType::Overflow || page.prev_pgno() != PGNO_INVALID {
        return Err(CoreError::invalid_operation(format!(
            "page {head} is not the head of an overflow chain"
        )));
    }
    if delta == 0 {
        return Ok(page.entries());
    }
    let count = u16::try_from(i32::from(page.entries()) + delta).map_err(|_| {
        CoreError::invalid_operation(format!(
            "reference count {} of chain {head} cannot change by {delta}",
            page.entries()
        ))
    })?;
    let chain = overflow_chain(pages, head)?;

    tm.log_and_apply(
        txn,
        RecordBody::OvRef {
            pgno: head,
            adjust: delta,
            page_lsn: page.lsn(),
        },
    )?;

    if count == 0 {
        for pgno in &chain {
            let page = Page::read(pages, *pgno)?;
            tm.log_and_apply(
                txn,
                RecordBody::Big {
                    op: ItemOp::Remove,
                    pgno: *pgno,
                    prev_pgno: page.prev_pgno(),
                    next_pgno: page.next_pgno(),
                    data: page.overflow_data().to_vec(),
                    page_lsn: page.lsn(),
                },
            )?;
            free_page(tm, txn, *pgno)?;
        }
        debug!(txn = %txn.id(), head, pages = chain.len(), "overflow chain released");
    }
    Ok(count)
}
