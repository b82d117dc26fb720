//! Repository: the top-level object owning cache, registry, file directory,
//! and the commit pipeline
//!
//! One mutex serializes writers against the freeze: inserts take it to
//! allocate from the cache and splice into a memtable, the commit trigger
//! holds it for the whole freeze swap, and the background committer touches
//! it only to publish completion. Everything the committer reads in between
//! is frozen state captured at trigger time.

use crate::cache::Cache;
use crate::commit::{self, TableCommit};
use crate::fgroup::FileDir;
use crate::memtable::{MemCursor, MemTable};
use crate::meta::{Meta, TableConfig};
use crate::submit::SubmitMsg;
use crate::{RepoConfig, Result, TableId, TideError};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Name of the data directory under the repository root
pub const DATA_DIR_NAME: &str = "data";

/// Lifecycle state of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    /// Being created or reconfigured; not yet serving
    Configuring,
    /// Serving inserts and commits
    Active,
    /// Terminal; all entry points reject
    Closed,
}

/// Point-in-time repository statistics
#[derive(Debug, Clone)]
pub struct RepoStatus {
    /// Lifecycle state
    pub state: RepoState,
    /// Registered tables
    pub num_tables: usize,
    /// Bytes held by the cache arena across both generations
    pub cache_bytes: usize,
    /// On-disk partitions
    pub num_file_groups: usize,
    /// Whether a commit task is in flight
    pub commit_in_flight: bool,
}

struct Core {
    meta: Meta,
    state: RepoState,
    committing: bool,
}

pub(crate) struct RepoInner {
    root_dir: PathBuf,
    data_dir: PathBuf,
    config: RwLock<RepoConfig>,
    cache: Cache,
    core: Mutex<Core>,
    files: Mutex<FileDir>,
    committer: Mutex<Option<JoinHandle<()>>>,
}

/// A TideDB storage repository
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    /// Create a new repository under `root_dir`
    pub fn create(root_dir: impl AsRef<Path>, config: RepoConfig) -> Result<Self> {
        let root_dir = root_dir.as_ref();
        config.validate()?;
        std::fs::create_dir_all(root_dir)?;
        if root_dir.join(crate::config::CONFIG_FILE_NAME).exists() {
            return Err(TideError::Config(format!(
                "repository already exists at {}",
                root_dir.display()
            )));
        }
        config.save(root_dir)?;
        let data_dir = root_dir.join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir)?;

        let meta = Meta::new(root_dir, config.max_tables as usize);
        let files = FileDir::new(max_file_groups(&config));
        info!(root = %root_dir.display(), "created repository");
        Ok(Self::assemble(root_dir, data_dir, config, meta, files))
    }

    /// Open an existing repository
    pub fn open(root_dir: impl AsRef<Path>) -> Result<Self> {
        let root_dir = root_dir.as_ref();
        let config = RepoConfig::load(root_dir)?;
        let data_dir = root_dir.join(DATA_DIR_NAME);

        let meta = Meta::restore(root_dir, config.max_tables as usize)?;
        let files = FileDir::restore(&data_dir, max_file_groups(&config))?;
        info!(
            root = %root_dir.display(),
            tables = meta.num_tables(),
            file_groups = files.len(),
            "opened repository"
        );
        Ok(Self::assemble(root_dir, data_dir, config, meta, files))
    }

    fn assemble(
        root_dir: &Path,
        data_dir: PathBuf,
        config: RepoConfig,
        meta: Meta,
        files: FileDir,
    ) -> Self {
        let cache = Cache::new(config.max_cache_size as usize);
        Self {
            inner: Arc::new(RepoInner {
                root_dir: root_dir.to_path_buf(),
                data_dir,
                config: RwLock::new(config),
                cache,
                core: Mutex::new(Core {
                    meta,
                    state: RepoState::Active,
                    committing: false,
                }),
                files: Mutex::new(files),
                committer: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RepoState {
        self.inner.core.lock().state
    }

    /// Snapshot of the active configuration
    pub fn config(&self) -> RepoConfig {
        self.inner.config.read().clone()
    }

    /// Close the repository, waiting for an in-flight commit to drain.
    /// Files are kept.
    pub fn close(&self) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            if core.state == RepoState::Closed {
                return Ok(());
            }
            core.state = RepoState::Closed;
        }
        self.join_committer();
        info!(root = %self.inner.root_dir.display(), "closed repository");
        Ok(())
    }

    /// Close the repository and remove its files
    pub fn destroy(self) -> Result<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.inner.root_dir)?;
        info!(root = %self.inner.root_dir.display(), "destroyed repository");
        Ok(())
    }

    /// Apply a new configuration.
    ///
    /// `max_tables` and `precision` are baked into the on-disk layout and
    /// cannot change on a live repository.
    pub fn configure(&self, config: RepoConfig) -> Result<()> {
        config.validate()?;
        let core = self.inner.core.lock();
        if core.state != RepoState::Active {
            return Err(TideError::RepoClosed);
        }
        {
            let current = self.inner.config.read();
            if config.max_tables != current.max_tables {
                return Err(TideError::Config(
                    "max_tables cannot change on a live repository".into(),
                ));
            }
            if config.precision != current.precision {
                return Err(TideError::Config(
                    "precision cannot change on a live repository".into(),
                ));
            }
        }
        config.save(&self.inner.root_dir)?;
        self.inner.cache.set_capacity(config.max_cache_size as usize);
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Register a table
    pub fn create_table(&self, config: TableConfig) -> Result<()> {
        let mut core = self.lock_active()?;
        core.meta.create(config)
    }

    /// Replace a table's schema with a newer version
    pub fn alter_table(&self, config: TableConfig) -> Result<()> {
        let mut core = self.lock_active()?;
        core.meta.alter(config)
    }

    /// Drop a table; rows already committed stay on disk
    pub fn drop_table(&self, id: TableId) -> Result<()> {
        let mut core = self.lock_active()?;
        core.meta.drop_table(id)
    }

    /// Look up a table's configuration
    pub fn table_config(&self, id: TableId) -> Result<TableConfig> {
        let mut core = self.lock_active()?;
        Ok(core.meta.validate_for_insert(id)?.config())
    }

    /// List every registered table
    pub fn list_tables(&self) -> Vec<TableConfig> {
        let core = self.inner.core.lock();
        core.meta.tables().map(|t| t.config()).collect()
    }

    /// Insert a submit message, returning the number of rows inserted.
    ///
    /// Rows are applied one by one; a failure fails the submit block but
    /// keeps every row that preceded it.
    pub fn insert(&self, msg: &[u8]) -> Result<usize> {
        self.lock_active()?;
        let parsed = SubmitMsg::parse(msg)?;
        let mut inserted = 0;
        for block in parsed.blocks() {
            let block = block?;
            let mut core = self.lock_active()?;
            let table = core.meta.validate_for_insert(block.table_id())?;

            if table.mem.is_none() {
                table.mem = Some(MemTable::new(
                    self.inner.cache.current(),
                    table.schema.clone(),
                ));
            }
            let mem = table.mem.as_mut().expect("memtable just ensured");
            if block.sversion != mem.schema().version() {
                return Err(TideError::OutOfBounds(format!(
                    "submit block schema version {} does not match table version {}",
                    block.sversion,
                    mem.schema().version()
                )));
            }
            for row in block.rows() {
                mem.insert(&self.inner.cache, row?)?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Freeze the active state and start a background commit task.
    ///
    /// Rejected while a commit is in flight. If a frozen generation is
    /// retained from a failed commit, the task retries it and the freeze is
    /// skipped.
    pub fn trigger_commit(&self) -> Result<()> {
        let mut core = self.lock_active()?;
        if core.committing {
            return Err(TideError::CommitInProgress);
        }

        if self.inner.cache.frozen().is_none() {
            for table in core.meta.tables_mut() {
                if let Some(mem) = table.mem.take() {
                    table.imem = Some(Arc::new(mem));
                }
            }
            self.inner.cache.freeze()?;
        }

        // Snapshot the frozen state for the task while still holding the
        // mutex, so it never touches the registry again until publish
        let frozen = self.inner.cache.frozen().expect("generation just frozen");
        let mut tables = Vec::new();
        for tid in 0..core.meta.capacity() as i32 {
            if let Some(table) = core.meta.table(tid) {
                if let Some(imem) = &table.imem {
                    tables.push(TableCommit {
                        tid,
                        uid: table.id.uid,
                        cursor: MemCursor::new(imem.clone()),
                    });
                }
            }
        }
        core.committing = true;

        let inner = self.inner.clone();
        let handle = std::thread::spawn(move || {
            let config = inner.config.read().clone();
            let result = commit::run(
                &config,
                &inner.data_dir,
                &inner.files,
                &frozen,
                &mut tables,
            );
            drop(tables);
            drop(frozen);

            let mut core = inner.core.lock();
            match result {
                Ok(()) => {
                    for table in core.meta.tables_mut() {
                        table.imem = None;
                    }
                    inner.cache.reclaim();
                }
                Err(err) => {
                    // Old files are intact and the frozen state is retained;
                    // a later trigger retries from it
                    warn!(error = %err, "commit failed, frozen state retained");
                }
            }
            core.committing = false;
        });
        *self.inner.committer.lock() = Some(handle);
        Ok(())
    }

    /// Trigger a commit and wait for it to finish
    pub fn flush(&self) -> Result<()> {
        match self.trigger_commit() {
            Ok(()) | Err(TideError::CommitInProgress) => {}
            Err(err) => return Err(err),
        }
        self.join_committer();
        Ok(())
    }

    /// Point-in-time statistics
    pub fn status(&self) -> RepoStatus {
        let core = self.inner.core.lock();
        RepoStatus {
            state: core.state,
            num_tables: core.meta.num_tables(),
            cache_bytes: self.inner.cache.bytes_used(),
            num_file_groups: self.inner.files.lock().len(),
            commit_in_flight: core.committing,
        }
    }

    fn lock_active(&self) -> Result<parking_lot::MutexGuard<'_, Core>> {
        let core = self.inner.core.lock();
        if core.state != RepoState::Active {
            return Err(TideError::RepoClosed);
        }
        Ok(core)
    }

    fn join_committer(&self) {
        // Take the handle first so joining never holds the committer lock
        let handle = self.inner.committer.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("commit task panicked");
                self.inner.core.lock().committing = false;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &RepoInner {
        &self.inner
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
impl RepoInner {
    pub(crate) fn force_committing(&self, value: bool) {
        self.core.lock().committing = value;
    }
}

fn max_file_groups(config: &RepoConfig) -> usize {
    (config.keep_days / config.days_per_file) as usize + 3
}
