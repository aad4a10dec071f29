//! Redo and undo of the core page and transaction records.
//!
//! Every page a record touches is checked on its own: redo applies when the
//! page LSN is below the record LSN and then stamps the record LSN; undo
//! applies when the page LSN equals the record LSN and then restores the
//! LSN the page had before the change.

use super::dispatch::{DispatchTable, RecoverFn, ReplayContext, ReplayOp, ReplayOutcome};
use crate::error::{CoreError, CoreResult};
use crate::log::{ItemOp, LogRecord, RecordBody, RecordKind};
use crate::page::{Page, PageType};
use crate::types::{Lsn, PageNo, PGNO_INVALID, PGNO_META};
use std::sync::Arc;
use tracing::debug;

/// Applies one record to the pages it names, honoring page LSNs.
struct PageTouch<'a> {
    ctx: &'a ReplayContext<'a>,
    lsn: Lsn,
    undo: bool,
    changed: bool,
}

impl<'a> PageTouch<'a> {
    fn new(ctx: &'a ReplayContext<'a>, lsn: Lsn, op: ReplayOp) -> Self {
        Self {
            ctx,
            lsn,
            undo: op.is_undo(),
            changed: false,
        }
    }

    fn page_size(&self) -> usize {
        self.ctx.pages.page_size()
    }

    /// Runs `f` on page `pgno` if its LSN says the change is due.
    fn page<F>(&mut self, pgno: PageNo, before: Lsn, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Page) -> CoreResult<()>,
    {
        let mut page = Page::read(self.ctx.pages, pgno)?;
        let due = if self.undo {
            page.lsn() == self.lsn
        } else {
            page.lsn() < self.lsn
        };
        if !due {
            return Ok(());
        }
        f(&mut page)?;
        page.set_lsn(if self.undo { before } else { self.lsn });
        self.ctx.pages.write_page(pgno, page.as_bytes())?;
        self.changed = true;
        Ok(())
    }

    fn outcome(&self) -> ReplayOutcome {
        match (self.changed, self.undo) {
            (false, _) => ReplayOutcome::Skipped,
            (true, false) => ReplayOutcome::Applied,
            (true, true) => ReplayOutcome::Undone,
        }
    }
}

fn zeroed(page: &mut Page) {
    *page = Page::from_bytes(vec![0u8; page.page_size()]);
}

fn fill_overflow(
    page: &mut Page,
    pgno: PageNo,
    prev: PageNo,
    next: PageNo,
    data: &[u8],
    refs: u16,
) -> CoreResult<()> {
    *page = Page::new(pgno, page.page_size(), PageType::Overflow);
    page.set_prev_pgno(prev);
    page.set_next_pgno(next);
    page.set_overflow_data(data)?;
    page.set_entries(refs);
    Ok(())
}

fn empty_overflow(page: &mut Page, pgno: PageNo) {
    *page = Page::new(pgno, page.page_size(), PageType::Overflow);
    page.set_prev_pgno(PGNO_INVALID);
    page.set_next_pgno(PGNO_INVALID);
}

fn free_page_with_header(page: &mut Page, header: &[u8]) -> CoreResult<()> {
    zeroed(page);
    page.restore_header(header)
}

fn adjust_entries(page: &Page, delta: i32, lsn: Lsn) -> CoreResult<u16> {
    let count = i32::from(page.entries()) + delta;
    u16::try_from(count).map_err(|_| {
        CoreError::inconsistency(
            lsn,
            format!("reference count of page {} would become {count}", page.pgno()),
        )
    })
}

/// Redo/undo for every core kind.
pub(crate) fn recover_core(
    ctx: &ReplayContext<'_>,
    record: &LogRecord,
    lsn: Lsn,
    op: ReplayOp,
) -> CoreResult<ReplayOutcome> {
    let record = record.clone().normalize();
    let mut touch = PageTouch::new(ctx, lsn, op);
    let undo = touch.undo;
    let size = touch.page_size();

    match &record.body {
        RecordBody::AddRem {
            op: item_op,
            pgno,
            index,
            item,
            page_lsn,
        } => {
            let adding = (*item_op == ItemOp::Add) != undo;
            touch.page(*pgno, *page_lsn, |page| {
                if adding {
                    page.insert_raw(*index, item)
                } else {
                    page.remove_raw(*index).map(|_| ())
                }
            })?;
        }

        RecordBody::Big {
            op: item_op,
            pgno,
            prev_pgno,
            next_pgno,
            data,
            page_lsn,
        } => {
            let pgno = *pgno;
            match (*item_op, undo) {
                (ItemOp::Add, false) => {
                    let refs = u16::from(*prev_pgno == PGNO_INVALID);
                    touch.page(pgno, *page_lsn, |page| {
                        fill_overflow(page, pgno, *prev_pgno, *next_pgno, data, refs)
                    })?;
                }
                (ItemOp::Remove, true) => {
                    touch.page(pgno, *page_lsn, |page| {
                        fill_overflow(page, pgno, *prev_pgno, *next_pgno, data, 0)
                    })?;
                }
                (ItemOp::Add, true) | (ItemOp::Remove, false) => {
                    touch.page(pgno, *page_lsn, |page| {
                        empty_overflow(page, pgno);
                        Ok(())
                    })?;
                }
            }
        }

        RecordBody::OvRef {
            pgno,
            adjust,
            page_lsn,
        } => {
            let delta = if undo { -*adjust } else { *adjust };
            touch.page(*pgno, *page_lsn, |page| {
                let count = adjust_entries(page, delta, lsn)?;
                page.set_entries(count);
                Ok(())
            })?;
        }

        RecordBody::Relink {
            add,
            pgno,
            page_lsn,
            prev_pgno,
            prev_page_lsn,
            next_pgno,
            next_page_lsn,
        } => {
            let linking = *add != undo;
            let (pgno, prev, next) = (*pgno, *prev_pgno, *next_pgno);
            touch.page(pgno, *page_lsn, |page| {
                if linking {
                    page.set_prev_pgno(prev);
                    page.set_next_pgno(next);
                } else {
                    page.set_prev_pgno(PGNO_INVALID);
                    page.set_next_pgno(PGNO_INVALID);
                }
                Ok(())
            })?;
            if prev != PGNO_INVALID {
                touch.page(prev, *prev_page_lsn, |page| {
                    page.set_next_pgno(if linking { pgno } else { next });
                    Ok(())
                })?;
            }
            if next != PGNO_INVALID {
                touch.page(next, *next_page_lsn, |page| {
                    page.set_prev_pgno(if linking { pgno } else { prev });
                    Ok(())
                })?;
            }
        }

        RecordBody::PgAlloc {
            meta_lsn,
            page_lsn,
            pgno,
            ptype,
            next,
            last_pgno,
            prev_free,
            prev_free_lsn,
            header,
        } => {
            let (pgno, next, last) = (*pgno, *next, *last_pgno);
            if *prev_free == PGNO_INVALID {
                touch.page(PGNO_META, *meta_lsn, |meta| {
                    if undo {
                        meta.set_last_pgno(last);
                        if pgno <= last {
                            meta.set_free_head(pgno);
                        }
                    } else {
                        meta.set_free_head(next);
                        meta.set_last_pgno(meta.last_pgno().max(pgno));
                    }
                    Ok(())
                })?;
            } else {
                touch.page(*prev_free, *prev_free_lsn, |prev| {
                    prev.set_next_pgno(if undo { pgno } else { next });
                    Ok(())
                })?;
            }
            touch.page(pgno, *page_lsn, |page| {
                if undo {
                    if header.is_empty() {
                        let free = Page::new_free(pgno, size, next);
                        page.restore_header(free.header())
                    } else {
                        page.restore_header(header)
                    }
                } else {
                    if page.page_type().is_unused() {
                        *page = Page::new(pgno, size, *ptype);
                    }
                    Ok(())
                }
            })?;
        }

        RecordBody::PgFree {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
            header,
        } => {
            let (pgno, next, last) = (*pgno, *next, *last_pgno);
            push_or_pop_meta(&mut touch, *meta_lsn, pgno, next, last)?;
            touch.page(pgno, *page_lsn, |page| {
                if undo {
                    free_page_with_header(page, header)
                } else {
                    *page = Page::new_free(pgno, size, next);
                    Ok(())
                }
            })?;
        }

        RecordBody::PgFreeData {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
            image,
        } => {
            let (pgno, next, last) = (*pgno, *next, *last_pgno);
            push_or_pop_meta(&mut touch, *meta_lsn, pgno, next, last)?;
            touch.page(pgno, *page_lsn, |page| {
                if undo {
                    page.restore_image(image)
                } else {
                    *page = Page::new_free(pgno, size, next);
                    Ok(())
                }
            })?;
        }

        RecordBody::PgNew {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
        } => {
            let (pgno, next, last) = (*pgno, *next, *last_pgno);
            push_or_pop_meta(&mut touch, *meta_lsn, pgno, next, last)?;
            touch.page(pgno, *page_lsn, |page| {
                if undo {
                    zeroed(page);
                } else {
                    *page = Page::new_free(pgno, size, next);
                }
                Ok(())
            })?;
        }

        RecordBody::PgSort {
            meta_lsn,
            last_pgno,
            new_last_pgno,
            free,
        } => {
            let (last, new_last) = (*last_pgno, *new_last_pgno);
            let order: Vec<PageNo> = if undo {
                free.iter().map(|(pgno, _)| *pgno).collect()
            } else {
                let mut kept: Vec<PageNo> = free
                    .iter()
                    .map(|(pgno, _)| *pgno)
                    .filter(|pgno| *pgno <= new_last)
                    .collect();
                kept.sort_unstable();
                kept
            };
            touch.page(PGNO_META, *meta_lsn, |meta| {
                meta.set_free_head(order.first().copied().unwrap_or(PGNO_INVALID));
                meta.set_last_pgno(if undo { last } else { new_last });
                Ok(())
            })?;
            for (pgno, before) in free {
                let pgno = *pgno;
                let position = order.iter().position(|p| *p == pgno);
                touch.page(pgno, *before, |page| {
                    match position {
                        Some(i) => {
                            let next = order.get(i + 1).copied().unwrap_or(PGNO_INVALID);
                            *page = Page::new_free(pgno, size, next);
                        }
                        None => zeroed(page),
                    }
                    Ok(())
                })?;
            }
        }

        RecordBody::PgInit {
            pgno,
            page_lsn,
            image,
        } => {
            touch.page(*pgno, *page_lsn, |page| {
                if undo {
                    page.restore_image(image)
                } else {
                    page.clear_items();
                    Ok(())
                }
            })?;
        }

        RecordBody::MetaSub {
            pgno,
            page_lsn,
            image,
        } => {
            touch.page(*pgno, *page_lsn, |page| {
                if undo {
                    zeroed(page);
                    Ok(())
                } else {
                    page.restore_image(image)
                }
            })?;
        }

        RecordBody::Noop { pgno, page_lsn } => {
            touch.page(*pgno, *page_lsn, |_| Ok(()))?;
        }

        RecordBody::Cksum => {
            if !undo && !ctx.catastrophic {
                return Err(CoreError::CatastrophicRecoveryRequired { lsn });
            }
        }

        RecordBody::PgPrepare { .. }
        | RecordBody::Debug { .. }
        | RecordBody::TxnRegop { .. }
        | RecordBody::TxnCheckpoint { .. }
        | RecordBody::TxnRecycle { .. } => {}

        RecordBody::InmemCreate { .. }
        | RecordBody::InmemRename { .. }
        | RecordBody::InmemRemove { .. }
        | RecordBody::Other { .. } => {
            return Err(CoreError::UnsupportedRecordKind {
                kind: record.code(),
            });
        }

        RecordBody::PgAlloc42 { .. }
        | RecordBody::PgFree42 { .. }
        | RecordBody::PgFreeData42 { .. }
        | RecordBody::Relink42 { .. } => {
            return Err(CoreError::inconsistency(lsn, "legacy record survived normalization"));
        }
    }

    let outcome = touch.outcome();
    debug!(%lsn, kind = record.name(), ?op, ?outcome, "record replayed");
    Ok(outcome)
}

/// Meta side of a page being pushed on (redo) or taken off (undo) the free
/// list head.
fn push_or_pop_meta(
    touch: &mut PageTouch<'_>,
    meta_lsn: Lsn,
    pgno: PageNo,
    next: PageNo,
    last: PageNo,
) -> CoreResult<()> {
    let undo = touch.undo;
    touch.page(PGNO_META, meta_lsn, |meta| {
        if undo {
            meta.set_free_head(next);
            meta.set_last_pgno(last);
        } else {
            meta.set_free_head(pgno);
            meta.set_last_pgno(meta.last_pgno().max(pgno));
        }
        Ok(())
    })
}

pub(crate) fn register_core(table: &mut DispatchTable) {
    let recover: RecoverFn = Arc::new(recover_core);
    for kind in RecordKind::ALL {
        if matches!(
            kind,
            RecordKind::InmemCreate | RecordKind::InmemRename | RecordKind::InmemRemove
        ) {
            continue;
        }
        table.register_kind(kind, kind.name(), Arc::clone(&recover), None);
    }
}
