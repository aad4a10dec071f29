//! Environment directory layout.
//!
//! ```text
//! <env_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ log.0000000001    # Log files, numbered from 1
//! ├─ log.0000000002
//! └─ pages.db          # Page store
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const PAGES_FILE: &str = "pages.db";

/// An environment directory held under an exclusive lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct EnvDir {
    path: PathBuf,
    _lock_file: File,
}

impl EnvDir {
    /// Opens or creates an environment directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `EnvironmentLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "environment directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::EnvironmentLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The directory, which also holds the log files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the page store.
    #[must_use]
    pub fn pages_path(&self) -> PathBuf {
        self.path.join(PAGES_FILE)
    }

    /// Whether the directory holds neither pages nor log files.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        if self.pages_path().exists() {
            return Ok(false);
        }
        for entry in fs::read_dir(&self.path)? {
            if entry?.file_name().to_string_lossy().starts_with("log.") {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
