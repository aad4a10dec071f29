//! # pagelog testkit
//!
//! Test utilities for pagelog.
//!
//! This crate provides:
//! - Environment fixtures over memory or a temporary directory
//! - Crash simulation: a log backend that tears writes and page-store
//!   images that mix flushed and unflushed pages
//! - An I/O journal for checking that log syncs precede page writes
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pagelog_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let env = TestEnv::memory();
//!     // ... operations
//!     let env = env.restart();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod journal;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::journal::*;
    pub use crate::init_test_logging;
}

static LOGGING: Once = Once::new();

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// Filtering follows `RUST_LOG`, defaulting to `warn`.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
