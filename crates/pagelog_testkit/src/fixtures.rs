//! Test fixtures and environment helpers.

use pagelog_core::{Config, CoreResult, Environment, LogManager};
use pagelog_storage::{MemoryPageStore, PageStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Page size used by the fixtures; small pages make overflow chains and
/// full pages cheap to reach.
pub const TEST_PAGE_SIZE: usize = 512;

/// Configuration used by the fixtures.
#[must_use]
pub fn test_config() -> Config {
    Config::default()
        .page_size(TEST_PAGE_SIZE)
        .max_log_file_size(64 * 1024)
}

enum Backing {
    Memory {
        log: Arc<LogManager>,
        pages: Arc<MemoryPageStore>,
    },
    Dir(TempDir),
}

/// A test environment with automatic cleanup.
pub struct TestEnv {
    /// The environment instance.
    pub env: Environment,
    config: Config,
    backing: Backing,
}

impl TestEnv {
    /// Creates a new in-memory test environment.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates a new in-memory test environment with `config`.
    pub fn memory_with(config: Config) -> Self {
        let log = Arc::new(LogManager::in_memory(config.max_log_file_size).expect("in-memory log"));
        let pages = Arc::new(MemoryPageStore::new(config.page_size));
        Self::over(log, pages, config).expect("Failed to open in-memory environment")
    }

    /// Opens an environment over an existing log and page image.
    ///
    /// # Errors
    ///
    /// Returns the error recovery reports.
    pub fn over(
        log: Arc<LogManager>,
        pages: Arc<MemoryPageStore>,
        config: Config,
    ) -> CoreResult<Self> {
        let env = Environment::open_with(
            Arc::clone(&log),
            Arc::clone(&pages) as Arc<dyn PageStore>,
            config.clone(),
        )?;
        Ok(Self {
            env,
            config,
            backing: Backing::Memory { log, pages },
        })
    }

    /// Creates a new environment in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = test_config();
        let env = Environment::open_dir(temp_dir.path(), config.clone())
            .expect("Failed to open directory environment");
        Self {
            env,
            config,
            backing: Backing::Dir(temp_dir),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The page store of an in-memory environment.
    pub fn memory_pages(&self) -> Option<&Arc<MemoryPageStore>> {
        match &self.backing {
            Backing::Memory { pages, .. } => Some(pages),
            Backing::Dir(_) => None,
        }
    }

    /// Every page written so far, for in-memory environments.
    pub fn snapshot(&self) -> BTreeMap<u32, Vec<u8>> {
        self.memory_pages().map(|p| p.snapshot()).unwrap_or_default()
    }

    /// Drops the environment and opens it again over the same log and
    /// pages, running recovery.
    pub fn restart(self) -> Self {
        self.try_restart().expect("Failed to reopen environment")
    }

    /// Like [`TestEnv::restart`], returning the open error.
    ///
    /// # Errors
    ///
    /// Returns the error recovery reports.
    pub fn try_restart(self) -> CoreResult<Self> {
        let Self { env, config, backing } = self;
        drop(env);
        match backing {
            Backing::Memory { log, pages } => Self::over(log, pages, config),
            Backing::Dir(temp_dir) => {
                let env = Environment::open_dir(temp_dir.path(), config.clone())?;
                Ok(Self {
                    env,
                    config,
                    backing: Backing::Dir(temp_dir),
                })
            }
        }
    }

    /// Drops the environment as if the process died with only `pages` on
    /// disk, keeping the log, and reopens it.
    ///
    /// # Errors
    ///
    /// Returns the error recovery reports.
    ///
    /// # Panics
    ///
    /// Panics for directory environments.
    pub fn crash_with(self, pages: MemoryPageStore) -> CoreResult<Self> {
        let Self { env, config, backing } = self;
        drop(env);
        match backing {
            Backing::Memory { log, .. } => Self::over(log, Arc::new(pages), config),
            Backing::Dir(_) => panic!("crash_with needs an in-memory environment"),
        }
    }
}

impl std::ops::Deref for TestEnv {
    type Target = Environment;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

/// Runs a test with a temporary in-memory environment.
pub fn with_test_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment) -> R,
{
    let test_env = TestEnv::memory();
    f(&test_env.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagelog_core::{Item, PageType};

    #[test]
    fn memory_env_restarts() {
        let env = TestEnv::memory();
        let mut txn = env.begin().unwrap();
        let pgno = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
        env.insert_item(&mut txn, pgno, 0, &Item::Data(b"kept".to_vec())).unwrap();
        env.commit(&mut txn).unwrap();

        let env = env.restart();
        assert_eq!(env.read_page(pgno).unwrap().item(0).unwrap(), Item::Data(b"kept".to_vec()));
        assert!(!env.snapshot().is_empty());
    }

    #[test]
    fn file_env_restarts() {
        let env = TestEnv::file();
        let mut txn = env.begin().unwrap();
        let head = env.put_overflow(&mut txn, &[3u8; 700]).unwrap();
        env.commit(&mut txn).unwrap();
        let env = env.restart();
        assert_eq!(env.read_overflow(head).unwrap(), vec![3u8; 700]);
        assert!(env.memory_pages().is_none());
    }

    #[test]
    fn with_test_env_runs_closure() {
        let next = with_test_env(|env| env.next_txnid());
        assert!(next.as_u32() > 1);
    }
}
