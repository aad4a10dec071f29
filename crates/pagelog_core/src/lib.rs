//! # pagelog core
//!
//! Durability core of a paged, transactional storage engine.
//!
//! This crate provides:
//! - Log sequence numbers and the framed, multi-file write-ahead log
//! - The log record codec, including decode-only legacy record shapes
//! - Page layouts and the structural operations the log records describe
//! - Transactions with live abort and checkpoints
//! - Crash recovery: the transaction ledger, limbo pages and a dispatch
//!   table that layered components extend with their own record kinds
//!
//! ## Example
//!
//! ```rust
//! use pagelog_core::{Config, Environment, Item, PageType};
//!
//! let env = Environment::open_in_memory(Config::default()).unwrap();
//! let mut txn = env.begin().unwrap();
//! let pgno = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
//! env.insert_item(&mut txn, pgno, 0, &Item::Data(b"x".to_vec())).unwrap();
//! env.commit(&mut txn).unwrap();
//! assert_eq!(env.read_page(pgno).unwrap().item(0).unwrap(), Item::Data(b"x".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
mod env;
mod error;
pub mod log;
pub mod ops;
pub mod page;
pub mod recovery;
pub mod txn;
mod types;

pub use config::{Config, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
pub use dir::EnvDir;
pub use env::Environment;
pub use error::{CoreError, CoreResult};
pub use log::{LogManager, LogRecord, LogSource, RecordBody, RecordKind};
pub use page::{Item, Page, PageType};
pub use recovery::{run_recovery, DispatchTable, RecoveryMode, RecoveryReport};
pub use txn::{Transaction, TransactionManager, TransactionState};
pub use types::{Lsn, PageNo, TxnId, PGNO_INVALID, PGNO_META};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
