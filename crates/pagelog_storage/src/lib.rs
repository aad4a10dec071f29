//! # pagelog storage
//!
//! Storage interfaces consumed by the pagelog durability core.
//!
//! This crate provides the two lowest-level abstractions the core writes
//! through and reads from:
//!
//! - [`StorageBackend`]: an **opaque byte store** used for log files. It has
//!   no knowledge of log frames or records.
//! - [`PageStore`]: fixed-size page buffers addressed by page number, the
//!   narrow interface of the buffer/cache layer that owns page I/O.
//!
//! ## Available Implementations
//!
//! - [`InMemoryBackend`] / [`MemoryPageStore`] - For testing and ephemeral use
//! - [`FileBackend`] / [`FilePageStore`] - Persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use pagelog_storage::{PageStore, MemoryPageStore};
//!
//! let store = MemoryPageStore::new(512);
//! store.write_page(3, &[7u8; 512]).unwrap();
//! assert_eq!(store.read_page(3).unwrap()[0], 7);
//! // Pages never written read back as zeroes.
//! assert_eq!(store.read_page(1).unwrap(), vec![0u8; 512]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod pages;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use pages::{FilePageStore, MemoryPageStore, PageStore};
