//! Write-ahead log: record model, wire codec, files and scans.

pub mod codec;
mod cursor;
mod manager;
mod print;
mod record;

pub use cursor::{BackwardScan, ForwardScan};
pub use manager::{log_file_name, BackendFactory, LogEntry, LogManager, LogSource};
pub use print::{format_record, hex_dump, print_record, RecordDump};
pub use record::{ItemOp, LogRecord, RecordBody, RecordKind, RegopOp};
