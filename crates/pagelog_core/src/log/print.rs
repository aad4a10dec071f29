//! Human-readable and JSON renderings of log records.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{ItemOp, LogRecord, RecordBody, RegopOp};
use crate::types::Lsn;
use serde::Serialize;
use std::fmt::Write as _;

/// A record flattened to named string fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordDump {
    /// Kind name.
    pub kind: &'static str,
    /// Numeric kind tag.
    pub code: u32,
    /// Owning transaction.
    pub txnid: u32,
    /// Previous record of the transaction.
    pub prev_lsn: Lsn,
    /// Kind-specific fields in log order.
    pub fields: Vec<(&'static str, String)>,
}

impl RecordDump {
    /// Flattens a record.
    #[must_use]
    pub fn from_record(record: &LogRecord) -> Self {
        Self {
            kind: record.name(),
            code: record.code(),
            txnid: record.txnid.as_u32(),
            prev_lsn: record.prev_lsn,
            fields: describe(&record.body),
        }
    }

    /// Serializes the dump as a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::invalid_operation(e.to_string()))
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn op_name(op: ItemOp) -> String {
    match op {
        ItemOp::Add => "add".into(),
        ItemOp::Remove => "remove".into(),
    }
}

fn describe(body: &RecordBody) -> Vec<(&'static str, String)> {
    match body {
        RecordBody::AddRem {
            op,
            pgno,
            index,
            item,
            page_lsn,
        } => vec![
            ("op", op_name(*op)),
            ("pgno", pgno.to_string()),
            ("index", index.to_string()),
            ("item", hex(item)),
            ("page_lsn", page_lsn.to_string()),
        ],
        RecordBody::Big {
            op,
            pgno,
            prev_pgno,
            next_pgno,
            data,
            page_lsn,
        } => vec![
            ("op", op_name(*op)),
            ("pgno", pgno.to_string()),
            ("prev_pgno", prev_pgno.to_string()),
            ("next_pgno", next_pgno.to_string()),
            ("data_len", data.len().to_string()),
            ("page_lsn", page_lsn.to_string()),
        ],
        RecordBody::OvRef {
            pgno,
            adjust,
            page_lsn,
        } => vec![
            ("pgno", pgno.to_string()),
            ("adjust", adjust.to_string()),
            ("page_lsn", page_lsn.to_string()),
        ],
        RecordBody::Relink {
            add,
            pgno,
            page_lsn,
            prev_pgno,
            prev_page_lsn,
            next_pgno,
            next_page_lsn,
        } => vec![
            ("add", add.to_string()),
            ("pgno", pgno.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("prev_pgno", prev_pgno.to_string()),
            ("prev_page_lsn", prev_page_lsn.to_string()),
            ("next_pgno", next_pgno.to_string()),
            ("next_page_lsn", next_page_lsn.to_string()),
        ],
        RecordBody::PgAlloc {
            meta_lsn,
            page_lsn,
            pgno,
            ptype,
            next,
            last_pgno,
            prev_free,
            prev_free_lsn,
            header: _,
        } => vec![
            ("meta_lsn", meta_lsn.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("pgno", pgno.to_string()),
            ("ptype", format!("{ptype:?}")),
            ("next", next.to_string()),
            ("last_pgno", last_pgno.to_string()),
            ("prev_free", prev_free.to_string()),
            ("prev_free_lsn", prev_free_lsn.to_string()),
        ],
        RecordBody::PgFree {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
            header: image,
        }
        | RecordBody::PgFreeData {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
            image,
        } => vec![
            ("meta_lsn", meta_lsn.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("pgno", pgno.to_string()),
            ("next", next.to_string()),
            ("last_pgno", last_pgno.to_string()),
            ("image_len", image.len().to_string()),
        ],
        RecordBody::PgInit {
            pgno,
            page_lsn,
            image,
        }
        | RecordBody::MetaSub {
            pgno,
            page_lsn,
            image,
        } => vec![
            ("pgno", pgno.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("image_len", image.len().to_string()),
        ],
        RecordBody::PgNew {
            meta_lsn,
            page_lsn,
            pgno,
            next,
            last_pgno,
        } => vec![
            ("meta_lsn", meta_lsn.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("pgno", pgno.to_string()),
            ("next", next.to_string()),
            ("last_pgno", last_pgno.to_string()),
        ],
        RecordBody::PgPrepare { pgno } => vec![("pgno", pgno.to_string())],
        RecordBody::PgSort {
            meta_lsn,
            last_pgno,
            new_last_pgno,
            free,
        } => vec![
            ("meta_lsn", meta_lsn.to_string()),
            ("last_pgno", last_pgno.to_string()),
            ("new_last_pgno", new_last_pgno.to_string()),
            (
                "free",
                free.iter()
                    .map(|(pgno, lsn)| format!("{pgno}@{lsn}"))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ],
        RecordBody::Cksum => Vec::new(),
        RecordBody::Debug {
            op,
            key,
            data,
            flags,
        } => vec![
            ("op", String::from_utf8_lossy(op).into_owned()),
            ("key", hex(key)),
            ("data", hex(data)),
            ("flags", format!("{flags:#x}")),
        ],
        RecordBody::Noop { pgno, page_lsn } => vec![
            ("pgno", pgno.to_string()),
            ("page_lsn", page_lsn.to_string()),
        ],
        RecordBody::InmemCreate { fid, name } | RecordBody::InmemRemove { fid, name } => {
            vec![("fid", hex(fid)), ("name", name.clone())]
        }
        RecordBody::InmemRename {
            fid,
            old_name,
            new_name,
        } => vec![
            ("fid", hex(fid)),
            ("old_name", old_name.clone()),
            ("new_name", new_name.clone()),
        ],
        RecordBody::TxnRegop {
            op,
            timestamp,
            parent,
        } => vec![
            (
                "op",
                match op {
                    RegopOp::Commit => "commit".into(),
                    RegopOp::Abort => "abort".into(),
                },
            ),
            ("timestamp", timestamp.to_string()),
            ("parent", parent.as_u32().to_string()),
        ],
        RecordBody::TxnCheckpoint {
            ckp_lsn,
            last_ckp,
            timestamp,
            next_txnid,
        } => vec![
            ("ckp_lsn", ckp_lsn.to_string()),
            ("last_ckp", last_ckp.to_string()),
            ("timestamp", timestamp.to_string()),
            ("next_txnid", next_txnid.as_u32().to_string()),
        ],
        RecordBody::TxnRecycle { min, max } => vec![
            ("min", min.as_u32().to_string()),
            ("max", max.as_u32().to_string()),
        ],
        RecordBody::PgAlloc42 {
            meta_lsn,
            page_lsn,
            pgno,
            ptype,
            next,
        } => vec![
            ("meta_lsn", meta_lsn.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("pgno", pgno.to_string()),
            ("ptype", format!("{ptype:?}")),
            ("next", next.to_string()),
        ],
        RecordBody::PgFree42 {
            pgno,
            meta_lsn,
            page_lsn,
            next,
            header: image,
        }
        | RecordBody::PgFreeData42 {
            pgno,
            meta_lsn,
            page_lsn,
            next,
            image,
        } => vec![
            ("pgno", pgno.to_string()),
            ("meta_lsn", meta_lsn.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("next", next.to_string()),
            ("image_len", image.len().to_string()),
        ],
        RecordBody::Relink42 {
            pgno,
            page_lsn,
            prev_pgno,
            prev_page_lsn,
            next_pgno,
            next_page_lsn,
        } => vec![
            ("pgno", pgno.to_string()),
            ("page_lsn", page_lsn.to_string()),
            ("prev_pgno", prev_pgno.to_string()),
            ("prev_page_lsn", prev_page_lsn.to_string()),
            ("next_pgno", next_pgno.to_string()),
            ("next_page_lsn", next_page_lsn.to_string()),
        ],
        RecordBody::Other { kind, bytes } => vec![
            ("tag", kind.to_string()),
            ("bytes", hex(bytes)),
        ],
    }
}

/// Renders a decoded record on one line.
#[must_use]
pub fn format_record(record: &LogRecord) -> String {
    let dump = RecordDump::from_record(record);
    let mut out = format!(
        "[{}] {} prev_lsn: {}",
        dump.kind,
        record.txnid,
        dump.prev_lsn
    );
    for (name, value) in &dump.fields {
        let _ = write!(out, " {name}: {value}");
    }
    out
}

/// Renders a hex dump, 16 bytes per line.
#[must_use]
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = format!("unprintable record ({} bytes)", bytes.len());
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "\n{:04x}:", line * 16);
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
    }
    out
}

/// Renders an encoded record body.
///
/// Never fails: bodies that do not decode fall back to a hex dump.
#[must_use]
pub fn print_record(bytes: &[u8]) -> String {
    match LogRecord::decode(bytes) {
        Ok(record) => format_record(&record),
        Err(_) => hex_dump(bytes),
    }
}
