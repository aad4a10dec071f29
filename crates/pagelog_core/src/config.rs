//! Environment configuration.

use crate::error::{CoreError, CoreResult};

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size; in-page offsets are 16 bits wide.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Configuration for opening an environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of every page in bytes. A power of two.
    pub page_size: usize,

    /// Maximum size of a single log file before rotation.
    pub max_log_file_size: u64,

    /// Whether to sync the log on every commit.
    pub sync_on_commit: bool,

    /// Whether to create the environment if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether recovery may proceed past a logged checksum failure.
    pub catastrophic_recovery: bool,

    /// Whether to write a checkpoint once recovery finishes.
    pub checkpoint_on_open: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_log_file_size: 10 * 1024 * 1024, // 10 MiB
            sync_on_commit: true,
            create_if_missing: true,
            catastrophic_recovery: false,
            checkpoint_on_open: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the maximum log file size.
    #[must_use]
    pub const fn max_log_file_size(mut self, size: u64) -> Self {
        self.max_log_file_size = size;
        self
    }

    /// Sets whether to sync the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether to create the environment if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether recovery accepts logged checksum failures.
    #[must_use]
    pub const fn catastrophic_recovery(mut self, value: bool) -> Self {
        self.catastrophic_recovery = value;
        self
    }

    /// Sets whether to checkpoint after recovery.
    #[must_use]
    pub const fn checkpoint_on_open(mut self, value: bool) -> Self {
        self.checkpoint_on_open = value;
        self
    }

    /// Checks the settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the page size is not a power
    /// of two between [`MIN_PAGE_SIZE`] and [`MAX_PAGE_SIZE`], or the log
    /// file size cannot hold a single page image.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(CoreError::invalid_operation(format!(
                "page size {} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.max_log_file_size < 4 * self.page_size as u64
            || self.max_log_file_size > u64::from(u32::MAX)
        {
            return Err(CoreError::invalid_operation(format!(
                "max log file size {} out of range",
                self.max_log_file_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.max_log_file_size, 10 * 1024 * 1024);
        assert!(config.sync_on_commit);
        assert!(!config.catastrophic_recovery);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .page_size(512)
            .max_log_file_size(4096)
            .checkpoint_on_open(false)
            .catastrophic_recovery(true);

        assert_eq!(config.page_size, 512);
        assert_eq!(config.max_log_file_size, 4096);
        assert!(!config.checkpoint_on_open);
        assert!(config.catastrophic_recovery);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn odd_page_sizes_rejected() {
        assert!(Config::new().page_size(256).validate().is_err());
        assert!(Config::new().page_size(3000).validate().is_err());
        assert!(Config::new().page_size(65536).validate().is_err());
        assert!(Config::new().page_size(4096).max_log_file_size(100).validate().is_err());
    }
}
