//! Transactions: id allocation, log chaining, commit, live abort and
//! checkpoints.

mod manager;
mod state;

pub use manager::TransactionManager;
pub use state::{Transaction, TransactionState};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, for commit and checkpoint records.
pub(crate) fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
