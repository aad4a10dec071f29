//! Environment facade and recovery on open.

use crate::config::Config;
use crate::dir::EnvDir;
use crate::error::{CoreError, CoreResult};
use crate::log::{ForwardScan, LogManager, LogRecord, LogSource, RecordBody};
use crate::ops;
use crate::page::{Item, Page, PageType};
use crate::recovery::container::{self, ContainerRegistry};
use crate::recovery::{find_last_checkpoint, DispatchTable, Recovery, RecoveryMode, RecoveryReport};
use crate::txn::{Transaction, TransactionManager};
use crate::types::{Lsn, PageNo, TxnId, PGNO_META};
use pagelog_storage::{FilePageStore, MemoryPageStore, PageStore};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// The main environment handle.
///
/// `Environment` owns the log, the page store, the dispatch table and the
/// transaction manager. Opening one runs full crash recovery over the log
/// window of the last checkpoint, creates the metadata page of a new
/// environment and, unless configured otherwise, writes a checkpoint.
///
/// # Opening an Environment
///
/// ```rust,ignore
/// use pagelog_core::{Config, Environment, Item, PageType};
///
/// let env = Environment::open_dir(Path::new("my_env"), Config::default())?;
/// let mut txn = env.begin()?;
/// let pgno = env.allocate_page(&mut txn, PageType::Leaf)?;
/// env.insert_item(&mut txn, pgno, 0, &Item::Data(b"x".to_vec()))?;
/// env.commit(&mut txn)?;
/// ```
pub struct Environment {
    config: Config,
    /// Directory lock. None for environments not opened from a directory.
    dir: Option<EnvDir>,
    log: Arc<LogManager>,
    pages: Arc<dyn PageStore>,
    containers: Arc<ContainerRegistry>,
    txn_manager: TransactionManager,
    recovery_report: RecoveryReport,
}

impl Environment {
    /// Opens an environment in a directory, creating it if configured to.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the environment locked (`EnvironmentLocked`)
    /// - The environment does not exist and `create_if_missing` is false
    /// - Recovery fails
    /// - I/O errors occur
    pub fn open_dir(path: &Path, config: Config) -> CoreResult<Self> {
        config.validate()?;
        let dir = EnvDir::open(path, config.create_if_missing)?;
        if !config.create_if_missing && dir.is_empty()? {
            return Err(CoreError::invalid_operation(format!(
                "no environment in {} and create_if_missing is false",
                path.display()
            )));
        }
        let log = Arc::new(LogManager::open_dir(dir.path(), config.max_log_file_size)?);
        let pages: Arc<dyn PageStore> =
            Arc::new(FilePageStore::open(&dir.pages_path(), config.page_size)?);
        Self::open_inner(log, pages, config, Some(dir))
    }

    /// Opens a fresh environment backed by memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn open_in_memory(config: Config) -> CoreResult<Self> {
        config.validate()?;
        let log = Arc::new(LogManager::in_memory(config.max_log_file_size)?);
        let pages: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(config.page_size));
        Self::open_inner(log, pages, config, None)
    }

    /// Opens an environment over an existing log and page store.
    ///
    /// Recovery runs against whatever the two hold, so handing in the log
    /// and pages of a dropped environment simulates a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the page sizes disagree or recovery fails.
    pub fn open_with(
        log: Arc<LogManager>,
        pages: Arc<dyn PageStore>,
        config: Config,
    ) -> CoreResult<Self> {
        config.validate()?;
        Self::open_inner(log, pages, config, None)
    }

    fn open_inner(
        log: Arc<LogManager>,
        pages: Arc<dyn PageStore>,
        config: Config,
        dir: Option<EnvDir>,
    ) -> CoreResult<Self> {
        if pages.page_size() != config.page_size {
            return Err(CoreError::invalid_operation(format!(
                "page store uses {}-byte pages, configuration says {}",
                pages.page_size(),
                config.page_size
            )));
        }

        let containers = Arc::new(ContainerRegistry::new());
        let mut dispatch = DispatchTable::with_core_handlers();
        container::register(&mut dispatch, &containers);
        let dispatch = Arc::new(dispatch);

        let checkpoint = find_last_checkpoint(log.as_ref())?;
        let recovery_report = Recovery::new()
            .catastrophic(config.catastrophic_recovery)
            .run(log.as_ref(), pages.as_ref(), &dispatch, checkpoint, RecoveryMode::FullCrash)?;

        let txn_manager = TransactionManager::with_state(
            Arc::clone(&log),
            Arc::clone(&pages),
            dispatch,
            config.sync_on_commit,
            recovery_report.next_txnid,
            checkpoint.unwrap_or(Lsn::ZERO),
        );

        let meta = Page::read(pages.as_ref(), PGNO_META)?;
        if meta.page_type() == PageType::Invalid {
            if !config.create_if_missing {
                return Err(CoreError::invalid_operation(
                    "environment has no metadata page and create_if_missing is false",
                ));
            }
            let mut txn = txn_manager.begin()?;
            txn_manager.log_and_apply(
                &mut txn,
                RecordBody::MetaSub {
                    pgno: PGNO_META,
                    page_lsn: meta.lsn(),
                    image: Page::new_meta(config.page_size).into_bytes(),
                },
            )?;
            txn_manager.commit(&mut txn)?;
            info!(page_size = config.page_size, "metadata page created");
        } else {
            meta.check_meta()?;
        }

        if config.checkpoint_on_open {
            txn_manager.checkpoint()?;
        }
        info!(
            next_txnid = %txn_manager.next_txnid(),
            containers = containers.len(),
            "environment opened"
        );

        Ok(Self {
            config,
            dir,
            log,
            pages,
            containers,
            txn_manager,
            recovery_report,
        })
    }

    /// The configuration the environment was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The directory, for environments opened with [`Environment::open_dir`].
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(EnvDir::path)
    }

    /// Counts from the recovery run at open.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    /// The log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// The page store.
    #[must_use]
    pub fn pages(&self) -> &Arc<dyn PageStore> {
        &self.pages
    }

    /// The transaction manager.
    #[must_use]
    pub fn txn_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    // Transactions.

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::begin`].
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.txn_manager.begin()
    }

    /// Begins a transaction nested under `parent`.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::begin_nested`].
    pub fn begin_nested(&self, parent: &Transaction) -> CoreResult<Transaction> {
        self.txn_manager.begin_nested(parent)
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::commit`].
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Lsn> {
        self.txn_manager.commit(txn)
    }

    /// Aborts a transaction, undoing its changes.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::abort`].
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<Lsn> {
        self.txn_manager.abort(txn)
    }

    /// Writes a checkpoint.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::checkpoint`].
    pub fn checkpoint(&self) -> CoreResult<Lsn> {
        self.txn_manager.checkpoint()
    }

    /// Restarts transaction ids at 1.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::recycle_ids`].
    pub fn recycle_ids(&self) -> CoreResult<Lsn> {
        self.txn_manager.recycle_ids()
    }

    /// Id the next transaction will get.
    #[must_use]
    pub fn next_txnid(&self) -> TxnId {
        self.txn_manager.next_txnid()
    }

    // Pages.

    /// Reads a page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page store read fails.
    pub fn read_page(&self, pgno: PageNo) -> CoreResult<Page> {
        Page::read(self.pages.as_ref(), pgno)
    }

    /// Pages on the free list, head first.
    ///
    /// # Errors
    ///
    /// See [`ops::free_list`].
    pub fn free_list(&self) -> CoreResult<Vec<PageNo>> {
        ops::free_list(self.pages.as_ref())
    }

    /// See [`ops::allocate_page`].
    ///
    /// # Errors
    ///
    /// See [`ops::allocate_page`].
    pub fn allocate_page(&self, txn: &mut Transaction, ptype: PageType) -> CoreResult<PageNo> {
        ops::allocate_page(&self.txn_manager, txn, ptype)
    }

    /// See [`ops::free_page`].
    ///
    /// # Errors
    ///
    /// See [`ops::free_page`].
    pub fn free_page(&self, txn: &mut Transaction, pgno: PageNo) -> CoreResult<()> {
        ops::free_page(&self.txn_manager, txn, pgno)
    }

    /// See [`ops::sort_free_list`].
    ///
    /// # Errors
    ///
    /// See [`ops::sort_free_list`].
    pub fn sort_free_list(&self, txn: &mut Transaction) -> CoreResult<usize> {
        ops::sort_free_list(&self.txn_manager, txn)
    }

    /// See [`ops::insert_item`].
    ///
    /// # Errors
    ///
    /// See [`ops::insert_item`].
    pub fn insert_item(
        &self,
        txn: &mut Transaction,
        pgno: PageNo,
        index: u16,
        item: &Item,
    ) -> CoreResult<Lsn> {
        ops::insert_item(&self.txn_manager, txn, pgno, index, item)
    }

    /// See [`ops::remove_item`].
    ///
    /// # Errors
    ///
    /// See [`ops::remove_item`].
    pub fn remove_item(&self, txn: &mut Transaction, pgno: PageNo, index: u16) -> CoreResult<Item> {
        ops::remove_item(&self.txn_manager, txn, pgno, index)
    }

    /// See [`ops::init_page`].
    ///
    /// # Errors
    ///
    /// See [`ops::init_page`].
    pub fn init_page(&self, txn: &mut Transaction, pgno: PageNo) -> CoreResult<Lsn> {
        ops::init_page(&self.txn_manager, txn, pgno)
    }

    /// See [`ops::noop`].
    ///
    /// # Errors
    ///
    /// See [`ops::noop`].
    pub fn noop(&self, txn: &mut Transaction, pgno: PageNo) -> CoreResult<Lsn> {
        ops::noop(&self.txn_manager, txn, pgno)
    }

    /// See [`ops::link_page`].
    ///
    /// # Errors
    ///
    /// See [`ops::link_page`].
    pub fn link_page(
        &self,
        txn: &mut Transaction,
        pgno: PageNo,
        prev: PageNo,
        next: PageNo,
    ) -> CoreResult<Lsn> {
        ops::link_page(&self.txn_manager, txn, pgno, prev, next)
    }

    /// See [`ops::unlink_page`].
    ///
    /// # Errors
    ///
    /// See [`ops::unlink_page`].
    pub fn unlink_page(&self, txn: &mut Transaction, pgno: PageNo) -> CoreResult<Lsn> {
        ops::unlink_page(&self.txn_manager, txn, pgno)
    }

    /// See [`ops::prepare_page`].
    ///
    /// # Errors
    ///
    /// See [`ops::prepare_page`].
    pub fn prepare_page(&self, txn: &mut Transaction, pgno: PageNo) -> CoreResult<Lsn> {
        ops::prepare_page(&self.txn_manager, txn, pgno)
    }

    /// See [`ops::put_overflow`].
    ///
    /// # Errors
    ///
    /// See [`ops::put_overflow`].
    pub fn put_overflow(&self, txn: &mut Transaction, data: &[u8]) -> CoreResult<PageNo> {
        ops::put_overflow(&self.txn_manager, txn, data)
    }

    /// See [`ops::read_overflow`].
    ///
    /// # Errors
    ///
    /// See [`ops::read_overflow`].
    pub fn read_overflow(&self, head: PageNo) -> CoreResult<Vec<u8>> {
        ops::read_overflow(self.pages.as_ref(), head)
    }

    /// See [`ops::adjust_overflow_refcount`].
    ///
    /// # Errors
    ///
    /// See [`ops::adjust_overflow_refcount`].
    pub fn adjust_overflow_refcount(
        &self,
        txn: &mut Transaction,
        head: PageNo,
        delta: i32,
    ) -> CoreResult<u16> {
        ops::adjust_overflow_refcount(&self.txn_manager, txn, head, delta)
    }

    // Containers.

    /// The container registry, rebuilt by recovery at open.
    #[must_use]
    pub fn containers(&self) -> &ContainerRegistry {
        &self.containers
    }

    /// Creates a container.
    ///
    /// # Errors
    ///
    /// See [`container::create_container`].
    pub fn create_container(&self, txn: &mut Transaction, name: &str) -> CoreResult<Uuid> {
        container::create_container(&self.txn_manager, &self.containers, txn, name)
    }

    /// Renames a container.
    ///
    /// # Errors
    ///
    /// See [`container::rename_container`].
    pub fn rename_container(
        &self,
        txn: &mut Transaction,
        old_name: &str,
        new_name: &str,
    ) -> CoreResult<()> {
        container::rename_container(&self.txn_manager, &self.containers, txn, old_name, new_name)
    }

    /// Removes a container.
    ///
    /// # Errors
    ///
    /// See [`container::remove_container`].
    pub fn remove_container(&self, txn: &mut Transaction, name: &str) -> CoreResult<Uuid> {
        container::remove_container(&self.txn_manager, &self.containers, txn, name)
    }

    // Diagnostics.

    /// Logs a checksum failure marker. Recovery refuses to pass it unless
    /// `catastrophic_recovery` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write or sync fails.
    pub fn report_checksum_failure(&self) -> CoreResult<Lsn> {
        let lsn = self.txn_manager.log_unowned(RecordBody::Cksum)?;
        self.log.sync()?;
        Ok(lsn)
    }

    /// Renders every record from `from` on, one line each, through the
    /// registered print handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn dump_log(&self, from: Lsn) -> CoreResult<Vec<String>> {
        let from = if from.is_zero() {
            match self.log.first_lsn()? {
                Some(first) => first,
                None => return Ok(Vec::new()),
            }
        } else {
            from
        };
        ForwardScan::new(self.log.as_ref(), from)
            .map(|entry| {
                let entry = entry?;
                Ok(format!("{} {}", entry.lsn, self.txn_manager.dispatch().print(&entry.body)))
            })
            .collect()
    }

    /// Syncs the log, then the pages.
    ///
    /// # Errors
    ///
    /// Returns an error if either sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.log.sync()?;
        self.pages.sync()?;
        Ok(())
    }

    /// Decodes the record at `lsn`.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid record starts there.
    pub fn read_record(&self, lsn: Lsn) -> CoreResult<LogRecord> {
        self.log
            .read_at(lsn)?
            .ok_or_else(|| CoreError::invalid_operation(format!("no record at {lsn}")))?
            .record()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path())
            .field("page_size", &self.config.page_size)
            .field("txn_manager", &self.txn_manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RegopOp;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::default().page_size(512)
    }

    fn reopen(env: Environment, config: Config) -> CoreResult<Environment> {
        let log = Arc::clone(env.log());
        let pages = Arc::clone(env.pages());
        drop(env);
        Environment::open_with(log, pages, config)
    }

    #[test]
    fn new_environment_has_metadata_page() {
        let env = Environment::open_in_memory(config()).unwrap();
        let meta = env.read_page(0).unwrap();
        meta.check_meta().unwrap();
        assert!(env.free_list().unwrap().is_empty());
        assert_eq!(env.txn_manager().committed_count(), 1);
        assert!(!env.txn_manager().last_checkpoint().is_zero());
    }

    #[test]
    fn committed_work_survives_reopen() {
        let env = Environment::open_in_memory(config()).unwrap();
        let mut txn = env.begin().unwrap();
        let pgno = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
        env.insert_item(&mut txn, pgno, 0, &Item::Data(b"x".to_vec())).unwrap();
        env.commit(&mut txn).unwrap();
        let next = env.next_txnid();

        let env = reopen(env, config()).unwrap();
        assert_eq!(env.read_page(pgno).unwrap().item(0).unwrap(), Item::Data(b"x".to_vec()));
        assert!(env.next_txnid() >= next);
    }

    #[test]
    fn missing_environment_not_created() {
        let result = Environment::open_in_memory(config().create_if_missing(false));
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn page_size_must_match() {
        let log = Arc::new(LogManager::in_memory(1 << 20).unwrap());
        let pages: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(1024));
        assert!(Environment::open_with(log, pages, config()).is_err());
    }

    #[test]
    fn checksum_marker_blocks_reopen() {
        let env = Environment::open_in_memory(config()).unwrap();
        env.report_checksum_failure().unwrap();
        let log = Arc::clone(env.log());
        let pages = Arc::clone(env.pages());
        drop(env);

        let result = Environment::open_with(Arc::clone(&log), Arc::clone(&pages), config());
        assert!(matches!(result, Err(CoreError::CatastrophicRecoveryRequired { .. })));
        Environment::open_with(log, pages, config().catastrophic_recovery(true)).unwrap();
    }

    #[test]
    fn containers_rebuilt_on_reopen() {
        let env = Environment::open_in_memory(config().checkpoint_on_open(false)).unwrap();
        let mut txn = env.begin().unwrap();
        let fid = env.create_container(&mut txn, "orders").unwrap();
        env.commit(&mut txn).unwrap();
        let mut loser = env.begin().unwrap();
        env.create_container(&mut loser, "scratch").unwrap();

        let env = reopen(env, config().checkpoint_on_open(false)).unwrap();
        assert_eq!(env.containers().get("orders"), Some(fid));
        assert_eq!(env.containers().get("scratch"), None);
        assert_eq!(env.recovery_report().forced_aborts, 1);
    }

    #[test]
    fn dump_log_prints_every_record() {
        let env = Environment::open_in_memory(config()).unwrap();
        let mut txn = env.begin().unwrap();
        env.create_container(&mut txn, "c").unwrap();
        let marker = env.commit(&mut txn).unwrap();
        let lines = env.dump_log(Lsn::ZERO).unwrap();
        assert!(lines.iter().any(|l| l.contains("[inmem_create]")));
        assert!(lines.last().unwrap().starts_with(&marker.to_string()));
        assert!(matches!(
            env.read_record(marker).unwrap().body,
            RecordBody::TxnRegop { op: RegopOp::Commit, .. }
        ));
    }

    #[test]
    fn directory_environment_reopens() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("env");
        let pgno;
        {
            let env = Environment::open_dir(&path, config()).unwrap();
            assert!(matches!(
                Environment::open_dir(&path, config()),
                Err(CoreError::EnvironmentLocked)
            ));
            let mut txn = env.begin().unwrap();
            pgno = env.put_overflow(&mut txn, &[7u8; 900]).unwrap();
            env.commit(&mut txn).unwrap();
            env.sync().unwrap();
        }
        let env = Environment::open_dir(&path, config().create_if_missing(false)).unwrap();
        assert_eq!(env.read_overflow(pgno).unwrap(), vec![7u8; 900]);
        assert_eq!(env.path(), Some(path.as_path()));
    }

    #[test]
    fn missing_directory_not_created() {
        let temp = tempdir().unwrap();
        let result = Environment::open_dir(&temp.path().join("none"), config().create_if_missing(false));
        assert!(result.is_err());
    }
}
