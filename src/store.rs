use crate::{
    config::StoreOptions,
    error::{FatalError, StoreError},
    gc::GarbageCollector,
    index::{Indices, BLOBS_DIR, LINKS_DIR, PATHS_DIR, TMP_DIR},
    journal::Journal,
    lock::{LockOwner, LockTable},
    metrics::StoreMetrics,
    path::{NodeId, QualifiedPath},
    pool::RevisionPool,
    program::{interpret, ExecutionHandler, Phase, Program},
    resource::ResourceId,
    revision::Revision,
    table::RevisionTable,
    transaction::{Transaction, EX, RO, RW},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub const LOCK_FILE: &str = "store.lock";
pub const JOURNAL_FILE: &str = "journal.wal";
pub const TABLE_FILE: &str = "revisions.tbl";

/// The transactional resource store: the top-level façade composing the
/// journal, revision pool, indices, lock table and garbage collector into
/// read-only, read-write and exclusive transaction handles.
///
/// Cheap to clone; all clones share one underlying store. At most one
/// process may have a given store root open (enforced with a lock file).
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    root: PathBuf,
    pub(crate) options: StoreOptions,
    pub(crate) indices: Indices,
    pub(crate) pool: RevisionPool,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) locks: LockTable,
    pub(crate) gc: GarbageCollector,
    pub(crate) metrics: StoreMetrics,
    registry: Mutex<Registry>,
    next_owner: AtomicU64,
}

#[derive(Default, Debug)]
struct Registry {
    open: usize,
    exclusive: bool,
}

fn acquire_lock_file(root: &Path) -> Result<(), StoreError> {
    match fs::OpenOptions::new().write(true).create_new(true).open(root.join(LOCK_FILE)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::IllegalState(
            "store is locked; another process has it open (or crashed without removing the lock \
             file)",
        )),
        Err(e) => Err(e.into()),
    }
}

impl Store {
    /// Lays out a new store root and opens it: lock file, journal, revision
    /// table, and the index directories.
    pub fn create(root: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        crate::config::logger::init(options.log_level());
        fs::create_dir_all(root)?;
        for dir in [PATHS_DIR, LINKS_DIR, BLOBS_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        acquire_lock_file(root)?;

        let journal = Journal::create(
            &root.join(JOURNAL_FILE),
            options.journal_slot_size(),
            options.journal_slot_count(),
        )?;
        let table = RevisionTable::create(&root.join(TABLE_FILE), options.table_slot_count())?;
        let pool = RevisionPool::open(table)?;
        info!("created store at {}", root.display());
        Ok(Self::assemble(root, options, journal, pool))
    }

    /// Opens an existing store root: validates the on-disk files, replays
    /// surviving journal programs, clears leftover scratch files, and sweeps
    /// whatever the replay made garbage.
    pub fn open(root: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        crate::config::logger::init(options.log_level());
        acquire_lock_file(root)?;
        let opened = Self::open_locked(root, options);
        if opened.is_err() {
            let _ = fs::remove_file(root.join(LOCK_FILE));
        }
        opened
    }

    fn open_locked(root: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let table = RevisionTable::open(&root.join(TABLE_FILE), options.table_slot_count())?;
        let pool = RevisionPool::open(table)?;
        let indices = Indices::new(root);
        let gc = GarbageCollector::new();

        let recovery = Journal::open(&root.join(JOURNAL_FILE))?;
        for program in recovery.programs() {
            let commits = program.phases().contains(Phase::Commit);
            if commits {
                apply(&indices, &gc, program, Phase::Commit)?;
            }
            if program.phases().contains(Phase::Cleanup) {
                apply(&indices, &gc, program, Phase::Cleanup)?;
            }
            if commits {
                // The program was durable, so its revision counts as
                // committed even though the crash preempted the publish.
                pool.publish_recovered(program.revision())?;
            }
        }
        let journal =
            recovery.into_journal(options.journal_slot_size(), options.journal_slot_count())?;

        clear_scratch(root)?;
        let reclaimed = gc.sweep()?;
        if reclaimed > 0 {
            debug!("recovery reclaimed {reclaimed} files");
        }

        info!("opened store at {} ({})", root.display(), pool.current());
        let store = Self {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                options,
                indices,
                pool,
                journal: Mutex::new(journal),
                locks: LockTable::new(),
                gc,
                metrics: StoreMetrics::default(),
                registry: Mutex::new(Registry::default()),
                next_owner: AtomicU64::new(1),
            }),
        };
        Ok(store)
    }

    fn assemble(root: &Path, options: StoreOptions, journal: Journal, pool: RevisionPool) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                options,
                indices: Indices::new(root),
                pool,
                journal: Mutex::new(journal),
                locks: LockTable::new(),
                gc: GarbageCollector::new(),
                metrics: StoreMetrics::default(),
                registry: Mutex::new(Registry::default()),
                next_owner: AtomicU64::new(1),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// The newest published revision.
    pub fn current_revision(&self) -> Revision {
        self.inner.pool.current()
    }

    /// Opens a read-only transaction at the current revision.
    pub fn begin_ro(&self, node: NodeId) -> Result<Transaction<'_, RO>, StoreError> {
        self.inner.register(false)?;
        let snapshot = self.inner.lock_current_revision();
        self.inner.metrics.ro_transactions_opened.record(1.0);
        Ok(Transaction::new(self, node, snapshot, None, false))
    }

    /// Opens a read-write transaction at the current revision, owning one
    /// journal slot until it closes.
    pub fn begin_rw(&self, node: NodeId) -> Result<Transaction<'_, RW>, StoreError> {
        self.inner.register(false)?;
        let slot = match self.inner.journal.lock().acquire() {
            Ok(slot) => slot,
            Err(e) => {
                self.inner.deregister(false);
                return Err(e);
            }
        };
        let snapshot = self.inner.lock_current_revision();
        self.inner.metrics.rw_transactions_opened.record(1.0);
        Ok(Transaction::new(self, node, snapshot, Some(slot), false))
    }

    /// Opens an exclusive read-write transaction: a read-write transaction
    /// with purge authority. Requires that no other transaction is open, and
    /// keeps others out until it closes.
    pub fn begin_exclusive(&self, node: NodeId) -> Result<Transaction<'_, EX>, StoreError> {
        self.inner.register(true)?;
        let slot = match self.inner.journal.lock().acquire() {
            Ok(slot) => slot,
            Err(e) => {
                self.inner.deregister(true);
                return Err(e);
            }
        };
        let snapshot = self.inner.lock_current_revision();
        self.inner.metrics.rw_transactions_opened.record(1.0);
        Ok(Transaction::new(self, node, snapshot, Some(slot), true))
    }

    /// Runs one garbage collector sweep.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let reclaimed = self.inner.gc.sweep()?;
        self.inner.metrics.gc_files_reclaimed.record(reclaimed as f64);
        Ok(reclaimed)
    }
}

impl StoreInner {
    pub(crate) fn next_owner(&self) -> LockOwner {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Locks the current published revision against sweeping. A concurrent
    /// commit may publish and sweep between reading the watermark and taking
    /// the lock, so the read is repeated until the locked revision is still
    /// the current one.
    pub(crate) fn lock_current_revision(&self) -> Revision {
        let mut snapshot = self.pool.current();
        loop {
            self.gc.lock_revision(snapshot);
            let current = self.pool.current();
            if current == snapshot {
                return snapshot;
            }
            self.gc.unlock_revision(snapshot).expect("revision locked just above");
            snapshot = current;
        }
    }

    pub(crate) fn register(&self, exclusive: bool) -> Result<(), StoreError> {
        let mut registry = self.registry.lock();
        if registry.exclusive {
            return Err(StoreError::IllegalState("an exclusive transaction is open"));
        }
        if exclusive {
            if registry.open > 0 {
                return Err(StoreError::IllegalState(
                    "exclusive access requires that no other transaction is open",
                ));
            }
            registry.exclusive = true;
        }
        registry.open += 1;
        Ok(())
    }

    pub(crate) fn deregister(&self, exclusive: bool) {
        let mut registry = self.registry.lock();
        registry.open -= 1;
        if exclusive {
            registry.exclusive = false;
        }
    }

    /// Interprets one phase of a committed program against the durable
    /// indices.
    pub(crate) fn apply(&self, program: &Program, phase: Phase) -> Result<(), StoreError> {
        apply(&self.indices, &self.gc, program, phase)
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.root.join(LOCK_FILE)) {
            warn!("failed to remove lock file at {}: {e}", self.root.display());
        }
    }
}

fn apply(
    indices: &Indices,
    gc: &GarbageCollector,
    program: &Program,
    phase: Phase,
) -> Result<(), StoreError> {
    let mut handler = StoreHandler { indices, gc, revision: program.revision() };
    interpret(program, phase, &mut handler)
}

/// Deletes whatever is left in `tmp/` after journal replay: scratch files of
/// transactions that died before journaling anything.
fn clear_scratch(root: &Path) -> Result<(), StoreError> {
    let tmp = root.join(TMP_DIR);
    fs::create_dir_all(&tmp)?;
    for dirent in fs::read_dir(&tmp)? {
        let dirent = dirent?;
        if dirent.file_type()?.is_file() {
            fs::remove_file(dirent.path())?;
        }
    }
    Ok(())
}

/// Applies program commands to the durable indices. All operations are
/// idempotent with respect to re-application at the same revision, because
/// the same program is replayed during crash recovery.
struct StoreHandler<'a> {
    indices: &'a Indices,
    gc: &'a GarbageCollector,
    revision: Revision,
}

impl ExecutionHandler for StoreHandler<'_> {
    fn unlink_file(&mut self, file: &str) -> Result<(), StoreError> {
        self.indices.resources.remove_scratch(file)
    }

    fn unlink_path(&mut self, path: &QualifiedPath) -> Result<(), StoreError> {
        match self.indices.paths.entry_at(path, self.revision)? {
            // Replay: this unlink already ran and a later link in the same
            // program overwrote its tombstone with a live entry.
            Some((revision, false, _)) if revision == self.revision => {}
            Some((_, false, Some(id))) => {
                self.indices.paths.remove(path, self.revision, Some(id))?;
                self.indices.links.unlink(id, path, self.revision)?;
                self.gc.schedule_all(
                    self.indices.paths.superseded(path, self.revision)?,
                    self.revision,
                );
                self.gc
                    .schedule_all(self.indices.links.superseded(id, self.revision)?, self.revision);
            }
            // Replay: the tombstone we wrote is already in place; redo the
            // reverse-index side, which it recorded the id for.
            Some((revision, true, Some(id))) if revision == self.revision => {
                self.indices.links.unlink(id, path, self.revision)?;
                self.gc.schedule_all(
                    self.indices.paths.superseded(path, self.revision)?,
                    self.revision,
                );
            }
            Some((_, false, None)) => {
                return Err(FatalError::Malformed("path entry without resource id").into())
            }
            _ => {}
        }
        Ok(())
    }

    fn remove_resource(&mut self, id: ResourceId) -> Result<(), StoreError> {
        self.indices.links.mark_removed(id, self.revision)?;
        self.gc.schedule_all(self.indices.removal_garbage(id, self.revision)?, self.revision);
        Ok(())
    }

    fn link_file_to_path(&mut self, file: &str, path: &QualifiedPath) -> Result<(), StoreError> {
        let source = self.indices.resources.scratch_path(file)?;
        self.indices.paths.install(path, self.revision, &source)?;
        self.gc.schedule_all(self.indices.paths.superseded(path, self.revision)?, self.revision);
        Ok(())
    }

    fn link_resource_to_path(
        &mut self,
        id: ResourceId,
        path: &QualifiedPath,
    ) -> Result<(), StoreError> {
        self.indices.links.link(id, path, self.revision)
    }

    fn link_file_to_resource(&mut self, file: &str, id: ResourceId) -> Result<(), StoreError> {
        self.indices.resources.promote(file, id)?;
        self.indices.links.mark_created(id, self.revision)
    }
}
