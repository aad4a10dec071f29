//! Log record types and serialization.
//!
//! Body layout: `kind (4) | txnid (4) | prev_lsn (8) | fields...`, all
//! little-endian; variable-length fields carry a `u32` length prefix.

use crate::error::{CoreError, CoreResult};
use crate::log::codec::{FieldReader, FieldWriter};
use crate::page::PageType;
use crate::types::{Lsn, PageNo, TxnId, PGNO_INVALID};

/// Numeric tag of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum RecordKind {
    /// Commit or abort marker.
    TxnRegop = 10,
    /// Checkpoint.
    TxnCheckpoint = 11,
    /// Transaction id range recycled.
    TxnRecycle = 12,
    /// Item added to or removed from a slotted page.
    AddRem = 41,
    /// Overflow page filled or emptied.
    Big = 43,
    /// Overflow chain reference count changed.
    OvRef = 44,
    /// Page linked into or out of a sibling chain.
    Relink = 45,
    /// Diagnostic marker.
    Debug = 47,
    /// Page LSN touched.
    Noop = 48,
    /// Page allocated.
    PgAlloc = 49,
    /// Empty page freed.
    PgFree = 50,
    /// Page holding items freed.
    PgFreeData = 51,
    /// Page emptied in place.
    PgInit = 52,
    /// Page past the end of the file put on the free list.
    PgNew = 53,
    /// Allocation by a prepared transaction.
    PgPrepare = 54,
    /// Free list sorted and trimmed.
    PgSort = 55,
    /// Checksum failure detected at run time.
    Cksum = 56,
    /// Metadata page image.
    MetaSub = 57,
    /// Named in-memory container created.
    InmemCreate = 60,
    /// Named in-memory container renamed.
    InmemRename = 61,
    /// Named in-memory container removed.
    InmemRemove = 62,
    /// Pre-`last_pgno` allocation record.
    PgAlloc42 = 141,
    /// Pre-`last_pgno` free record.
    PgFree42 = 142,
    /// Pre-`last_pgno` free-with-data record.
    PgFreeData42 = 143,
    /// Remove-only relink record.
    Relink42 = 144,
}

impl RecordKind {
    /// Every kind, in tag order.
    pub const ALL: [Self; 25] = [
        Self::TxnRegop,
        Self::TxnCheckpoint,
        Self::TxnRecycle,
        Self::AddRem,
        Self::Big,
        Self::OvRef,
        Self::Relink,
        Self::Debug,
        Self::Noop,
        Self::PgAlloc,
        Self::PgFree,
        Self::PgFreeData,
        Self::PgInit,
        Self::PgNew,
        Self::PgPrepare,
        Self::PgSort,
        Self::Cksum,
        Self::MetaSub,
        Self::InmemCreate,
        Self::InmemRename,
        Self::InmemRemove,
        Self::PgAlloc42,
        Self::PgFree42,
        Self::PgFreeData42,
        Self::Relink42,
    ];

    /// Converts a tag to a kind.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// The numeric tag.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Whether this kind is only ever decoded, never written.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(
            self,
            Self::PgAlloc42 | Self::PgFree42 | Self::PgFreeData42 | Self::Relink42
        )
    }

    /// Lower-case name used in printed output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TxnRegop => "txn_regop",
            Self::TxnCheckpoint => "txn_ckp",
            Self::TxnRecycle => "txn_recycle",
            Self::AddRem => "addrem",
            Self::Big => "big",
            Self::OvRef => "ovref",
            Self::Relink => "relink",
            Self::Debug => "debug",
            Self::Noop => "noop",
            Self::PgAlloc => "pg_alloc",
            Self::PgFree => "pg_free",
            Self::PgFreeData => "pg_freedata",
            Self::PgInit => "pg_init",
            Self::PgNew => "pg_new",
            Self::PgPrepare => "pg_prepare",
            Self::PgSort => "pg_sort",
            Self::Cksum => "cksum",
            Self::MetaSub => "metasub",
            Self::InmemCreate => "inmem_create",
            Self::InmemRename => "inmem_rename",
            Self::InmemRemove => "inmem_remove",
            Self::PgAlloc42 => "pg_alloc_42",
            Self::PgFree42 => "pg_free_42",
            Self::PgFreeData42 => "pg_freedata_42",
            Self::Relink42 => "relink_42",
        }
    }
}

impl From<RecordKind> for u32 {
    fn from(kind: RecordKind) -> Self {
        kind.code()
    }
}

/// Direction of an item or overflow-page change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ItemOp {
    /// Add.
    Add = 1,
    /// Remove.
    Remove = 2,
}

/// Outcome carried by a transaction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegopOp {
    /// Commit.
    Commit = 1,
    /// Abort.
    Abort = 2,
}

/// Kind-specific fields of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    /// An encoded [`crate::page::Item`] added at or removed from a slot.
    AddRem {
        /// Direction.
        op: ItemOp,
        /// Target page.
        pgno: PageNo,
        /// Slot index.
        index: u16,
        /// Encoded item.
        item: Vec<u8>,
        /// Page LSN before the change.
        page_lsn: Lsn,
    },
    /// An overflow page filled with (`Add`) or emptied of (`Remove`) data.
    Big {
        /// Direction.
        op: ItemOp,
        /// Overflow page.
        pgno: PageNo,
        /// Previous page in the chain.
        prev_pgno: PageNo,
        /// Next page in the chain.
        next_pgno: PageNo,
        /// The page's data.
        data: Vec<u8>,
        /// Page LSN before the change.
        page_lsn: Lsn,
    },
    /// Reference count of an overflow chain adjusted.
    OvRef {
        /// Chain head.
        pgno: PageNo,
        /// Signed change.
        adjust: i32,
        /// Page LSN before the change.
        page_lsn: Lsn,
    },
    /// `pgno` linked between (`add`) or unlinked from its siblings.
    Relink {
        /// Link or unlink.
        add: bool,
        /// The page moved.
        pgno: PageNo,
        /// Its LSN before the change.
        page_lsn: Lsn,
        /// Previous sibling.
        prev_pgno: PageNo,
        /// Previous sibling's LSN before the change.
        prev_page_lsn: Lsn,
        /// Next sibling.
        next_pgno: PageNo,
        /// Next sibling's LSN before the change.
        next_page_lsn: Lsn,
    },
    /// Page taken off the free list (or the file extended).
    PgAlloc {
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// The allocated page.
        pgno: PageNo,
        /// Type the page is initialized to.
        ptype: PageType,
        /// Free-list successor of the page.
        next: PageNo,
        /// Metadata `last_pgno` before the change.
        last_pgno: PageNo,
        /// Free-list predecessor, or [`PGNO_INVALID`] for the head.
        prev_free: PageNo,
        /// Predecessor's LSN before the change.
        prev_free_lsn: Lsn,
        /// Page header before the change.
        header: Vec<u8>,
    },
    /// Page without items pushed on the free list.
    PgFree {
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// The freed page.
        pgno: PageNo,
        /// Previous free-list head.
        next: PageNo,
        /// Metadata `last_pgno` before the change.
        last_pgno: PageNo,
        /// Page header before the change.
        header: Vec<u8>,
    },
    /// Page holding items pushed on the free list.
    PgFreeData {
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// The freed page.
        pgno: PageNo,
        /// Previous free-list head.
        next: PageNo,
        /// Metadata `last_pgno` before the change.
        last_pgno: PageNo,
        /// Full page image before the change.
        image: Vec<u8>,
    },
    /// Page emptied keeping its type.
    PgInit {
        /// The page.
        pgno: PageNo,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// Full page image before the change.
        image: Vec<u8>,
    },
    /// Page beyond `last_pgno` put on the free list.
    PgNew {
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// The page.
        pgno: PageNo,
        /// Previous free-list head.
        next: PageNo,
        /// Metadata `last_pgno` before the change.
        last_pgno: PageNo,
    },
    /// A prepared transaction holds `pgno`.
    PgPrepare {
        /// The page.
        pgno: PageNo,
    },
    /// Free list sorted ascending and trailing pages dropped.
    PgSort {
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// `last_pgno` before.
        last_pgno: PageNo,
        /// `last_pgno` after.
        new_last_pgno: PageNo,
        /// The free list before, in list order, with each page's LSN.
        free: Vec<(PageNo, Lsn)>,
    },
    /// A checksum failure was detected.
    Cksum,
    /// Diagnostic marker.
    Debug {
        /// Operation name.
        op: Vec<u8>,
        /// Key bytes.
        key: Vec<u8>,
        /// Data bytes.
        data: Vec<u8>,
        /// Caller flags.
        flags: u32,
    },
    /// Only the page LSN changes.
    Noop {
        /// The page.
        pgno: PageNo,
        /// Page LSN before the change.
        page_lsn: Lsn,
    },
    /// Metadata page written from an image.
    MetaSub {
        /// The page.
        pgno: PageNo,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// New page image.
        image: Vec<u8>,
    },
    /// Container created.
    InmemCreate {
        /// File id.
        fid: [u8; 16],
        /// Container name.
        name: String,
    },
    /// Container renamed.
    InmemRename {
        /// File id.
        fid: [u8; 16],
        /// Name before.
        old_name: String,
        /// Name after.
        new_name: String,
    },
    /// Container removed.
    InmemRemove {
        /// File id.
        fid: [u8; 16],
        /// Container name.
        name: String,
    },
    /// Commit or abort marker.
    TxnRegop {
        /// Outcome.
        op: RegopOp,
        /// Seconds since the Unix epoch.
        timestamp: u64,
        /// Parent of a nested transaction, or [`TxnId::NONE`].
        parent: TxnId,
    },
    /// Checkpoint.
    TxnCheckpoint {
        /// Redo needs nothing earlier than this.
        ckp_lsn: Lsn,
        /// Previous checkpoint record.
        last_ckp: Lsn,
        /// Seconds since the Unix epoch.
        timestamp: u64,
        /// Next transaction id to hand out.
        next_txnid: TxnId,
    },
    /// Ids in `min..=max` are reused from here on.
    TxnRecycle {
        /// Lowest recycled id.
        min: TxnId,
        /// Highest recycled id.
        max: TxnId,
    },
    /// Allocation as written before `last_pgno` was logged.
    PgAlloc42 {
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// The allocated page.
        pgno: PageNo,
        /// New page type.
        ptype: PageType,
        /// Free-list successor.
        next: PageNo,
    },
    /// Free as written before `last_pgno` was logged.
    PgFree42 {
        /// The freed page.
        pgno: PageNo,
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// Previous free-list head.
        next: PageNo,
        /// Page header before the change.
        header: Vec<u8>,
    },
    /// Free-with-data as written before `last_pgno` was logged.
    PgFreeData42 {
        /// The freed page.
        pgno: PageNo,
        /// Metadata page LSN before the change.
        meta_lsn: Lsn,
        /// Page LSN before the change.
        page_lsn: Lsn,
        /// Previous free-list head.
        next: PageNo,
        /// Full page image before the change.
        image: Vec<u8>,
    },
    /// Unlink-only relink.
    Relink42 {
        /// The page unlinked.
        pgno: PageNo,
        /// Its LSN before the change.
        page_lsn: Lsn,
        /// Previous sibling.
        prev_pgno: PageNo,
        /// Previous sibling's LSN.
        prev_page_lsn: Lsn,
        /// Next sibling.
        next_pgno: PageNo,
        /// Next sibling's LSN.
        next_page_lsn: Lsn,
    },
    /// A record owned by a layered component, kept as raw field bytes for
    /// the handler registered under its tag.
    Other {
        /// Numeric tag; never one of the [`RecordKind`] codes.
        kind: u32,
        /// Everything after the common header.
        bytes: Vec<u8>,
    },
}

/// A log record: owning transaction, undo-chain link and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Owning transaction, or [`TxnId::NONE`].
    pub txnid: TxnId,
    /// Previous record of the same transaction, or [`Lsn::ZERO`].
    pub prev_lsn: Lsn,
    /// Kind-specific fields.
    pub body: RecordBody,
}

fn page_type(code: u8) -> CoreResult<PageType> {
    PageType::from_u8(code).ok_or_else(|| CoreError::malformed(format!("unknown page type {code}")))
}

fn item_op(code: u32) -> CoreResult<ItemOp> {
    match code {
        1 => Ok(ItemOp::Add),
        2 => Ok(ItemOp::Remove),
        other => Err(CoreError::malformed(format!("unknown item opcode {other}"))),
    }
}

fn regop_op(code: u32) -> CoreResult<RegopOp> {
    match code {
        1 => Ok(RegopOp::Commit),
        2 => Ok(RegopOp::Abort),
        other => Err(CoreError::malformed(format!("unknown regop opcode {other}"))),
    }
}

impl RecordBody {
    /// The core record kind, or `None` for a layered component's tag.
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        let kind = match self {
            Self::AddRem { .. } => RecordKind::AddRem,
            Self::Big { .. } => RecordKind::Big,
            Self::OvRef { .. } => RecordKind::OvRef,
            Self::Relink { .. } => RecordKind::Relink,
            Self::PgAlloc { .. } => RecordKind::PgAlloc,
            Self::PgFree { .. } => RecordKind::PgFree,
            Self::PgFreeData { .. } => RecordKind::PgFreeData,
            Self::PgInit { .. } => RecordKind::PgInit,
            Self::PgNew { .. } => RecordKind::PgNew,
            Self::PgPrepare { .. } => RecordKind::PgPrepare,
            Self::PgSort { .. } => RecordKind::PgSort,
            Self::Cksum => RecordKind::Cksum,
            Self::Debug { .. } => RecordKind::Debug,
            Self::Noop { .. } => RecordKind::Noop,
            Self::MetaSub { .. } => RecordKind::MetaSub,
            Self::InmemCreate { .. } => RecordKind::InmemCreate,
            Self::InmemRename { .. } => RecordKind::InmemRename,
            Self::InmemRemove { .. } => RecordKind::InmemRemove,
            Self::TxnRegop { .. } => RecordKind::TxnRegop,
            Self::TxnCheckpoint { .. } => RecordKind::TxnCheckpoint,
            Self::TxnRecycle { .. } => RecordKind::TxnRecycle,
            Self::PgAlloc42 { .. } => RecordKind::PgAlloc42,
            Self::PgFree42 { .. } => RecordKind::PgFree42,
            Self::PgFreeData42 { .. } => RecordKind::PgFreeData42,
            Self::Relink42 { .. } => RecordKind::Relink42,
            Self::Other { .. } => return None,
        };
        Some(kind)
    }

    /// The numeric tag written at the start of the body.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Other { kind, .. } => *kind,
            core => core.kind().map_or(0, RecordKind::code),
        }
    }

    /// Lower-case kind name; `"other"` for a layered component's tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind().map_or("other", RecordKind::name)
    }

    fn encode_fields(&self, w: &mut FieldWriter) {
        match self {
            Self::AddRem {
                op,
                pgno,
                index,
                item,
                page_lsn,
            } => {
                w.u32(*op as u32).u32(*pgno).u16(*index).bytes(item).lsn(*page_lsn);
            }
            Self::Big {
                op,
                pgno,
                prev_pgno,
                next_pgno,
                data,
                page_lsn,
            } => {
                w.u32(*op as u32)
                    .u32(*pgno)
                    .u32(*prev_pgno)
                    .u32(*next_pgno)
                    .bytes(data)
                    .lsn(*page_lsn);
            }
            Self::OvRef {
                pgno,
                adjust,
                page_lsn,
            } => {
                w.u32(*pgno).i32(*adjust).lsn(*page_lsn);
            }
            Self::Relink {
                add,
                pgno,
                page_lsn,
                prev_pgno,
                prev_page_lsn,
                next_pgno,
                next_page_lsn,
            } => {
                w.u8(u8::from(*add))
                    .u32(*pgno)
                    .lsn(*page_lsn)
                    .u32(*prev_pgno)
                    .lsn(*prev_page_lsn)
                    .u32(*next_pgno)
                    .lsn(*next_page_lsn);
            }
            Self::PgAlloc {
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
                w.lsn(*meta_lsn)
                    .lsn(*page_lsn)
                    .u32(*pgno)
                    .u8(ptype.as_u8())
                    .u32(*next)
                    .u32(*last_pgno)
                    .u32(*prev_free)
                    .lsn(*prev_free_lsn)
                    .bytes(header);
            }
            Self::PgFree {
                meta_lsn,
                page_lsn,
                pgno,
                next,
                last_pgno,
                header: image,
            }
            | Self::PgFreeData {
                meta_lsn,
                page_lsn,
                pgno,
                next,
                last_pgno,
                image,
            } => {
                w.lsn(*meta_lsn)
                    .lsn(*page_lsn)
                    .u32(*pgno)
                    .u32(*next)
                    .u32(*last_pgno)
                    .bytes(image);
            }
            Self::PgInit {
                pgno,
                page_lsn,
                image,
            }
            | Self::MetaSub {
                pgno,
                page_lsn,
                image,
            } => {
                w.u32(*pgno).lsn(*page_lsn).bytes(image);
            }
            Self::PgNew {
                meta_lsn,
                page_lsn,
                pgno,
                next,
                last_pgno,
            } => {
                w.lsn(*meta_lsn)
                    .lsn(*page_lsn)
                    .u32(*pgno)
                    .u32(*next)
                    .u32(*last_pgno);
            }
            Self::PgPrepare { pgno } => {
                w.u32(*pgno);
            }
            Self::PgSort {
                meta_lsn,
                last_pgno,
                new_last_pgno,
                free,
            } => {
                w.lsn(*meta_lsn)
                    .u32(*last_pgno)
                    .u32(*new_last_pgno)
                    .u32(free.len() as u32);
                for (pgno, lsn) in free {
                    w.u32(*pgno).lsn(*lsn);
                }
            }
            Self::Cksum => {}
            Self::Debug {
                op,
                key,
                data,
                flags,
            } => {
                w.bytes(op).bytes(key).bytes(data).u32(*flags);
            }
            Self::Noop { pgno, page_lsn } => {
                w.u32(*pgno).lsn(*page_lsn);
            }
            Self::InmemCreate { fid, name } | Self::InmemRemove { fid, name } => {
                w.raw(fid).string(name);
            }
            Self::InmemRename {
                fid,
                old_name,
                new_name,
            } => {
                w.raw(fid).string(old_name).string(new_name);
            }
            Self::TxnRegop {
                op,
                timestamp,
                parent,
            } => {
                w.u32(*op as u32).u64(*timestamp).txnid(*parent);
            }
            Self::TxnCheckpoint {
                ckp_lsn,
                last_ckp,
                timestamp,
                next_txnid,
            } => {
                w.lsn(*ckp_lsn)
                    .lsn(*last_ckp)
                    .u64(*timestamp)
                    .txnid(*next_txnid);
            }
            Self::TxnRecycle { min, max } => {
                w.txnid(*min).txnid(*max);
            }
            Self::PgAlloc42 {
                meta_lsn,
                page_lsn,
                pgno,
                ptype,
                next,
            } => {
                w.lsn(*meta_lsn)
                    .lsn(*page_lsn)
                    .u32(*pgno)
                    .u8(ptype.as_u8())
                    .u32(*next);
            }
            Self::PgFree42 {
                pgno,
                meta_lsn,
                page_lsn,
                next,
                header: image,
            }
            | Self::PgFreeData42 {
                pgno,
                meta_lsn,
                page_lsn,
                next,
                image,
            } => {
                w.u32(*pgno)
                    .lsn(*meta_lsn)
                    .lsn(*page_lsn)
                    .u32(*next)
                    .bytes(image);
            }
            Self::Relink42 {
                pgno,
                page_lsn,
                prev_pgno,
                prev_page_lsn,
                next_pgno,
                next_page_lsn,
            } => {
                w.u32(*pgno)
                    .lsn(*page_lsn)
                    .u32(*prev_pgno)
                    .lsn(*prev_page_lsn)
                    .u32(*next_pgno)
                    .lsn(*next_page_lsn);
            }
            Self::Other { bytes, .. } => {
                w.raw(bytes);
            }
        }
    }

    fn decode_fields(kind: RecordKind, r: &mut FieldReader<'_>) -> CoreResult<Self> {
        let body = match kind {
            RecordKind::AddRem => Self::AddRem {
                op: item_op(r.u32("op")?)?,
                pgno: r.u32("pgno")?,
                index: r.u16("index")?,
                item: r.bytes("item")?,
                page_lsn: r.lsn("page_lsn")?,
            },
            RecordKind::Big => Self::Big {
                op: item_op(r.u32("op")?)?,
                pgno: r.u32("pgno")?,
                prev_pgno: r.u32("prev_pgno")?,
                next_pgno: r.u32("next_pgno")?,
                data: r.bytes("data")?,
                page_lsn: r.lsn("page_lsn")?,
            },
            RecordKind::OvRef => Self::OvRef {
                pgno: r.u32("pgno")?,
                adjust: r.i32("adjust")?,
                page_lsn: r.lsn("page_lsn")?,
            },
            RecordKind::Relink => {
                let add = match r.u8("add")? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(CoreError::malformed(format!("relink flag {other}")));
                    }
                };
                Self::Relink {
                    add,
                    pgno: r.u32("pgno")?,
                    page_lsn: r.lsn("page_lsn")?,
                    prev_pgno: r.u32("prev_pgno")?,
                    prev_page_lsn: r.lsn("prev_page_lsn")?,
                    next_pgno: r.u32("next_pgno")?,
                    next_page_lsn: r.lsn("next_page_lsn")?,
                }
            }
            RecordKind::PgAlloc => Self::PgAlloc {
                meta_lsn: r.lsn("meta_lsn")?,
                page_lsn: r.lsn("page_lsn")?,
                pgno: r.u32("pgno")?,
                ptype: page_type(r.u8("ptype")?)?,
                next: r.u32("next")?,
                last_pgno: r.u32("last_pgno")?,
                prev_free: r.u32("prev_free")?,
                prev_free_lsn: r.lsn("prev_free_lsn")?,
                header: r.bytes("header")?,
            },
            RecordKind::PgFree | RecordKind::PgFreeData => {
                let meta_lsn = r.lsn("meta_lsn")?;
                let page_lsn = r.lsn("page_lsn")?;
                let pgno = r.u32("pgno")?;
                let next = r.u32("next")?;
                let last_pgno = r.u32("last_pgno")?;
                let image = r.bytes("image")?;
                if kind == RecordKind::PgFree {
                    Self::PgFree {
                        meta_lsn,
                        page_lsn,
                        pgno,
                        next,
                        last_pgno,
                        header: image,
                    }
                } else {
                    Self::PgFreeData {
                        meta_lsn,
                        page_lsn,
                        pgno,
                        next,
                        last_pgno,
                        image,
                    }
                }
            }
            RecordKind::PgInit | RecordKind::MetaSub => {
                let pgno = r.u32("pgno")?;
                let page_lsn = r.lsn("page_lsn")?;
                let image = r.bytes("image")?;
                if kind == RecordKind::PgInit {
                    Self::PgInit {
                        pgno,
                        page_lsn,
                        image,
                    }
                } else {
                    Self::MetaSub {
                        pgno,
                        page_lsn,
                        image,
                    }
                }
            }
            RecordKind::PgNew => Self::PgNew {
                meta_lsn: r.lsn("meta_lsn")?,
                page_lsn: r.lsn("page_lsn")?,
                pgno: r.u32("pgno")?,
                next: r.u32("next")?,
                last_pgno: r.u32("last_pgno")?,
            },
            RecordKind::PgPrepare => Self::PgPrepare {
                pgno: r.u32("pgno")?,
            },
            RecordKind::PgSort => {
                let meta_lsn = r.lsn("meta_lsn")?;
                let last_pgno = r.u32("last_pgno")?;
                let new_last_pgno = r.u32("new_last_pgno")?;
                let count = r.u32("free count")?;
                let mut free = Vec::new();
                for _ in 0..count {
                    free.push((r.u32("free pgno")?, r.lsn("free lsn")?));
                }
                Self::PgSort {
                    meta_lsn,
                    last_pgno,
                    new_last_pgno,
                    free,
                }
            }
            RecordKind::Cksum => Self::Cksum,
            RecordKind::Debug => Self::Debug {
                op: r.bytes("op")?,
                key: r.bytes("key")?,
                data: r.bytes("data")?,
                flags: r.u32("flags")?,
            },
            RecordKind::Noop => Self::Noop {
                pgno: r.u32("pgno")?,
                page_lsn: r.lsn("page_lsn")?,
            },
            RecordKind::InmemCreate => Self::InmemCreate {
                fid: r.array("fid")?,
                name: r.string("name")?,
            },
            RecordKind::InmemRename => Self::InmemRename {
                fid: r.array("fid")?,
                old_name: r.string("old_name")?,
                new_name: r.string("new_name")?,
            },
            RecordKind::InmemRemove => Self::InmemRemove {
                fid: r.array("fid")?,
                name: r.string("name")?,
            },
            RecordKind::TxnRegop => Self::TxnRegop {
                op: regop_op(r.u32("op")?)?,
                timestamp: r.u64("timestamp")?,
                parent: r.txnid("parent")?,
            },
            RecordKind::TxnCheckpoint => Self::TxnCheckpoint {
                ckp_lsn: r.lsn("ckp_lsn")?,
                last_ckp: r.lsn("last_ckp")?,
                timestamp: r.u64("timestamp")?,
                next_txnid: r.txnid("next_txnid")?,
            },
            RecordKind::TxnRecycle => Self::TxnRecycle {
                min: r.txnid("min")?,
                max: r.txnid("max")?,
            },
            RecordKind::PgAlloc42 => Self::PgAlloc42 {
                meta_lsn: r.lsn("meta_lsn")?,
                page_lsn: r.lsn("page_lsn")?,
                pgno: r.u32("pgno")?,
                ptype: page_type(r.u8("ptype")?)?,
                next: r.u32("next")?,
            },
            RecordKind::PgFree42 | RecordKind::PgFreeData42 => {
                let pgno = r.u32("pgno")?;
                let meta_lsn = r.lsn("meta_lsn")?;
                let page_lsn = r.lsn("page_lsn")?;
                let next = r.u32("next")?;
                let image = r.bytes("image")?;
                if kind == RecordKind::PgFree42 {
                    Self::PgFree42 {
                        pgno,
                        meta_lsn,
                        page_lsn,
                        next,
                        header: image,
                    }
                } else {
                    Self::PgFreeData42 {
                        pgno,
                        meta_lsn,
                        page_lsn,
                        next,
                        image,
                    }
                }
            }
            RecordKind::Relink42 => Self::Relink42 {
                pgno: r.u32("pgno")?,
                page_lsn: r.lsn("page_lsn")?,
                prev_pgno: r.u32("prev_pgno")?,
                prev_page_lsn: r.lsn("prev_page_lsn")?,
                next_pgno: r.u32("next_pgno")?,
                next_page_lsn: r.lsn("next_page_lsn")?,
            },
        };
        Ok(body)
    }

    /// The page whose state this record primarily describes, if any.
    #[must_use]
    pub fn pgno(&self) -> Option<PageNo> {
        match self {
            Self::AddRem { pgno, .. }
            | Self::Big { pgno, .. }
            | Self::OvRef { pgno, .. }
            | Self::Relink { pgno, .. }
            | Self::PgAlloc { pgno, .. }
            | Self::PgFree { pgno, .. }
            | Self::PgFreeData { pgno, .. }
            | Self::PgInit { pgno, .. }
            | Self::PgNew { pgno, .. }
            | Self::PgPrepare { pgno }
            | Self::Noop { pgno, .. }
            | Self::MetaSub { pgno, .. }
            | Self::PgAlloc42 { pgno, .. }
            | Self::PgFree42 { pgno, .. }
            | Self::PgFreeData42 { pgno, .. }
            | Self::Relink42 { pgno, .. } => Some(*pgno),
            _ => None,
        }
    }
}

impl LogRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(txnid: TxnId, prev_lsn: Lsn, body: RecordBody) -> Self {
        Self {
            txnid,
            prev_lsn,
            body,
        }
    }

    /// The core record kind, or `None` for a layered component's tag.
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        self.body.kind()
    }

    /// The numeric tag.
    #[must_use]
    pub fn code(&self) -> u32 {
        self.body.code()
    }

    /// Lower-case kind name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.body.name()
    }

    /// Serializes the record body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.u32(self.code())
            .txnid(self.txnid)
            .lsn(self.prev_lsn);
        self.body.encode_fields(&mut w);
        w.finish()
    }

    /// Deserializes a record body.
    ///
    /// # Errors
    ///
    /// A tag outside [`RecordKind`] decodes to [`RecordBody::Other`]; its
    /// fields are left to whichever handler is registered for it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedRecord`] for truncated input, trailing
    /// bytes or invalid enumerated fields.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut r = FieldReader::new(bytes);
        let code = r.u32("kind")?;
        let txnid = r.txnid("txnid")?;
        let prev_lsn = r.lsn("prev_lsn")?;
        let Some(kind) = RecordKind::from_code(code) else {
            return Ok(Self {
                txnid,
                prev_lsn,
                body: RecordBody::Other {
                    kind: code,
                    bytes: r.rest(),
                },
            });
        };
        let body = RecordBody::decode_fields(kind, &mut r)?;
        r.finish(kind.name())?;
        Ok(Self {
            txnid,
            prev_lsn,
            body,
        })
    }

    /// Converts legacy shapes to their current equivalent.
    ///
    /// Missing `last_pgno` values are taken to be the page itself and a
    /// legacy allocation always came from the free-list head.
    #[must_use]
    pub fn normalize(self) -> Self {
        let body = match self.body {
            RecordBody::PgAlloc42 {
                meta_lsn,
                page_lsn,
                pgno,
                ptype,
                next,
            } => RecordBody::PgAlloc {
                meta_lsn,
                page_lsn,
                pgno,
                ptype,
                next,
                last_pgno: pgno,
                prev_free: PGNO_INVALID,
                prev_free_lsn: Lsn::ZERO,
                header: Vec::new(),
            },
            RecordBody::PgFree42 {
                pgno,
                meta_lsn,
                page_lsn,
                next,
                header,
            } => RecordBody::PgFree {
                meta_lsn,
                page_lsn,
                pgno,
                next,
                last_pgno: pgno,
                header,
            },
            RecordBody::PgFreeData42 {
                pgno,
                meta_lsn,
                page_lsn,
                next,
                image,
            } => RecordBody::PgFreeData {
                meta_lsn,
                page_lsn,
                pgno,
                next,
                last_pgno: pgno,
                image,
            },
            RecordBody::Relink42 {
                pgno,
                page_lsn,
                prev_pgno,
                prev_page_lsn,
                next_pgno,
                next_page_lsn,
            } => RecordBody::Relink {
                add: false,
                pgno,
                page_lsn,
                prev_pgno,
                prev_page_lsn,
                next_pgno,
                next_page_lsn,
            },
            current => current,
        };
        Self { body, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc42() -> LogRecord {
        LogRecord::new(
            TxnId::new(7),
            Lsn::new(1, 200),
            RecordBody::PgAlloc42 {
                meta_lsn: Lsn::new(1, 100),
                page_lsn: Lsn::new(1, 50),
                pgno: 9,
                ptype: PageType::Leaf,
                next: 4,
            },
        )
    }

    #[test]
    fn kind_tags_are_unique() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(RecordKind::from_code(999), None);
    }

    #[test]
    fn body_starts_with_common_header() {
        let record = LogRecord::new(
            TxnId::new(3),
            Lsn::new(2, 64),
            RecordBody::Noop {
                pgno: 5,
                page_lsn: Lsn::new(1, 14),
            },
        );
        let bytes = record.encode();
        assert_eq!(&bytes[0..4], &48u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &64u32.to_le_bytes());
        assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn sort_record_with_list_decodes() {
        let record = LogRecord::new(
            TxnId::new(1),
            Lsn::ZERO,
            RecordBody::PgSort {
                meta_lsn: Lsn::new(1, 10),
                last_pgno: 9,
                new_last_pgno: 7,
                free: vec![(9, Lsn::new(1, 20)), (3, Lsn::new(1, 30)), (8, Lsn::new(1, 40))],
            },
        );
        assert_eq!(LogRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn unknown_kind_keeps_its_fields() {
        let mut bytes = alloc42().encode();
        bytes[0..4].copy_from_slice(&77u32.to_le_bytes());
        let record = LogRecord::decode(&bytes).unwrap();
        assert_eq!(record.kind(), None);
        assert_eq!((record.code(), record.name()), (77, "other"));
        assert_eq!(record.txnid, TxnId::new(7));
        assert_eq!(record.prev_lsn, Lsn::new(1, 200));
        match &record.body {
            RecordBody::Other { kind, bytes: fields } => {
                assert_eq!(*kind, 77);
                assert_eq!(fields.as_slice(), &bytes[16..]);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(record.encode(), bytes);
    }

    #[test]
    fn truncated_and_padded_bodies_are_malformed() {
        let bytes = alloc42().encode();
        assert!(matches!(
            LogRecord::decode(&bytes[..bytes.len() - 1]),
            Err(CoreError::MalformedRecord { .. })
        ));
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            LogRecord::decode(&padded),
            Err(CoreError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn inconsistent_embedded_length_is_malformed() {
        let record = LogRecord::new(
            TxnId::new(1),
            Lsn::ZERO,
            RecordBody::Debug {
                op: b"put".to_vec(),
                key: b"k".to_vec(),
                data: Vec::new(),
                flags: 0,
            },
        );
        let mut bytes = record.encode();
        // op length prefix sits right after the 16-byte common header
        bytes[16..20].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(CoreError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn legacy_alloc_normalizes_to_current_shape() {
        let decoded = LogRecord::decode(&alloc42().encode()).unwrap();
        assert_eq!(decoded.kind(), Some(RecordKind::PgAlloc42));
        let current = decoded.normalize();
        assert_eq!(current.kind(), Some(RecordKind::PgAlloc));
        assert_eq!(current.txnid, TxnId::new(7));
        match current.body {
            RecordBody::PgAlloc {
                pgno,
                next,
                last_pgno,
                prev_free,
                ..
            } => {
                assert_eq!((pgno, next, last_pgno, prev_free), (9, 4, 9, PGNO_INVALID));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn legacy_relink_normalizes_to_unlink() {
        let record = LogRecord::new(
            TxnId::new(2),
            Lsn::ZERO,
            RecordBody::Relink42 {
                pgno: 5,
                page_lsn: Lsn::new(1, 1),
                prev_pgno: 4,
                prev_page_lsn: Lsn::new(1, 2),
                next_pgno: 6,
                next_page_lsn: Lsn::new(1, 3),
            },
        )
        .normalize();
        assert!(matches!(record.body, RecordBody::Relink { add: false, pgno: 5, .. }));
    }

    #[test]
    fn current_shapes_are_untouched_by_normalize() {
        let record = LogRecord::new(TxnId::new(1), Lsn::ZERO, RecordBody::Cksum);
        assert_eq!(record.clone().normalize(), record);
    }
}
