use crate::{
    error::StoreError,
    index::{BLOBS_DIR, LINKS_DIR, PATHS_DIR, TMP_DIR},
    lock::LockOwner,
    path::{NodeId, ResourcePath},
    program::{Phase, PhaseMask},
    resource::ResourceId,
    revision::Revision,
    store::Store,
    working::WorkingCopy,
};
use log::{debug, error, warn};
use sealed::sealed;
use std::{fmt::Debug, fs, marker::PhantomData};

#[sealed]
pub trait TransactionKind: Debug {}

#[sealed]
pub trait WriteKind: TransactionKind {}

/// Read-only.
#[derive(Debug)]
pub struct RO {}

#[sealed]
impl TransactionKind for RO {}

/// Read-write.
#[derive(Debug)]
pub struct RW {}

#[sealed]
impl TransactionKind for RW {}

#[sealed]
impl WriteKind for RW {}

/// Exclusive read-write.
#[derive(Debug)]
pub struct EX {}

#[sealed]
impl TransactionKind for EX {}

#[sealed]
impl WriteKind for EX {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
    /// A commit failed after its program was journaled. The journal slot is
    /// deliberately left occupied so the program is replayed at next open.
    Poisoned,
}

/// A transaction over the store, fixed at the published revision current
/// when it began. Read-only transactions never block or conflict; writers
/// buffer their mutations in a working copy and fail fast on the first
/// conflicting lock instead of waiting.
///
/// Dropping an uncommitted transaction rolls it back.
pub struct Transaction<'tx, K: TransactionKind> {
    store: &'tx Store,
    state: TxState,
    owner: LockOwner,
    snapshot: Revision,
    slot: Option<u32>,
    exclusive: bool,
    working: Option<WorkingCopy<'tx>>,
    _marker: PhantomData<K>,
}

impl<'tx, K: TransactionKind> Transaction<'tx, K> {
    pub(crate) fn new(
        store: &'tx Store,
        node: NodeId,
        snapshot: Revision,
        slot: Option<u32>,
        exclusive: bool,
    ) -> Self {
        let owner = store.inner.next_owner();
        let working =
            WorkingCopy::new(&store.inner.indices, &store.inner.locks, owner, node, snapshot);
        Self {
            store,
            state: TxState::Open,
            owner,
            snapshot,
            slot,
            exclusive,
            working: Some(working),
            _marker: PhantomData,
        }
    }

    fn working(&self) -> Result<&WorkingCopy<'tx>, StoreError> {
        match (&self.working, self.state) {
            (Some(working), TxState::Open) => Ok(working),
            _ => Err(StoreError::IllegalState("transaction is no longer open")),
        }
    }

    /// The snapshot revision this transaction reads at.
    pub fn revision(&self) -> Revision {
        self.snapshot
    }

    /// The id linked at `path`, observing this transaction's own pending
    /// mutations; `None` when nothing is linked there.
    pub fn resolve(&self, path: &ResourcePath) -> Result<Option<ResourceId>, StoreError> {
        self.working()?.resolve(path)
    }

    pub fn resource_exists(&self, id: ResourceId) -> Result<bool, StoreError> {
        self.working()?.resource_exists(id)
    }

    /// Child segments linked directly under `path`, sorted.
    pub fn list(&self, path: &ResourcePath) -> Result<Vec<String>, StoreError> {
        self.working()?.list(path)
    }

    /// The content linked at `path`.
    pub fn read(&self, path: &ResourcePath) -> Result<Vec<u8>, StoreError> {
        let id = self.resolve(path)?.ok_or_else(|| StoreError::PathNotFound(path.clone()))?;
        self.read_resource(id)
    }

    /// The content of resource `id`.
    pub fn read_resource(&self, id: ResourceId) -> Result<Vec<u8>, StoreError> {
        if !self.working()?.resource_exists(id)? {
            return Err(StoreError::ResourceNotFound(id));
        }
        let inner = &self.store.inner;
        // Keep the blob around for the duration of this snapshot even if a
        // concurrent commit removes the resource and sweeps.
        inner.gc.pin(self.snapshot, inner.indices.resources.blob_path(id))?;
        match inner.indices.resources.read(id) {
            // Staged by this transaction, not yet promoted out of scratch.
            Err(StoreError::ResourceNotFound(_)) => {
                let scratch = inner.indices.resources.scratch_path(&format!("{TMP_DIR}/{id}"))?;
                Ok(fs::read(scratch)?)
            }
            result => result,
        }
    }

    /// Closes the transaction, rolling back any uncommitted mutations.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        if self.state != TxState::Open {
            return Ok(());
        }
        let result = self.rollback();
        self.state = TxState::RolledBack;
        self.release();
        result
    }

    /// Journals and executes the cleanup phase of the pending program,
    /// undoing staged files. A clean transaction rolls back to a no-op.
    fn rollback(&mut self) -> Result<(), StoreError> {
        let Some(working) = self.working.take() else { return Ok(()) };
        if !working.is_dirty() {
            return Ok(());
        }
        let inner = &self.store.inner;
        let mut program = working.compile();
        program.commit(PhaseMask::CLEANUP, inner.options.checksum(), inner.pool.current());
        if let Some(slot) = self.slot {
            inner.journal.lock().write(slot, &program)?;
        }
        inner.apply(&program, Phase::Cleanup)?;
        inner.metrics.rollbacks.record(1.0);
        debug!("rolled back transaction {}", self.owner);
        Ok(())
    }

    fn release(&mut self) {
        let store = self.store;
        let inner = &store.inner;
        inner.locks.release_all(self.owner);
        if let Some(slot) = self.slot.take() {
            if self.state == TxState::Poisoned {
                warn!("leaving journal slot {slot} occupied for recovery");
            } else if let Err(e) = inner.journal.lock().release(slot) {
                error!("failed to release journal slot {slot}: {e}");
            }
        }
        if let Err(e) = inner.gc.unlock_revision(self.snapshot) {
            error!("failed to unlock snapshot {}: {e}", self.snapshot);
        }
        inner.deregister(self.exclusive);
    }
}

impl<'tx, K: WriteKind> Transaction<'tx, K> {
    fn working_mut(&mut self) -> Result<&mut WorkingCopy<'tx>, StoreError> {
        match (&mut self.working, self.state) {
            (Some(working), TxState::Open) => Ok(working),
            _ => Err(StoreError::IllegalState("transaction is no longer open")),
        }
    }

    /// Stores `content` as a fresh resource linked at `path`, returning its
    /// generated id.
    pub fn save_new_resource(
        &mut self,
        path: &ResourcePath,
        content: &[u8],
    ) -> Result<ResourceId, StoreError> {
        self.working_mut()?.save_new_resource(path, content)
    }

    /// Stores `content` as a new resource with a caller-chosen id, linked at
    /// `path`.
    pub fn link_new_resource(
        &mut self,
        path: &ResourcePath,
        id: ResourceId,
        content: &[u8],
    ) -> Result<(), StoreError> {
        self.working_mut()?.link_new_resource(path, id, content)
    }

    /// Links an existing resource at an additional `path`.
    pub fn link_existing_resource(
        &mut self,
        path: &ResourcePath,
        id: ResourceId,
    ) -> Result<(), StoreError> {
        self.working_mut()?.link_existing_resource(path, id)
    }

    /// Unlinks `path`; the resource itself stays, reachable by id and any
    /// other paths.
    pub fn unlink(&mut self, path: &ResourcePath) -> Result<(), StoreError> {
        self.working_mut()?.unlink(path)
    }

    /// Removes a resource and every path linked to it.
    pub fn remove_resource(&mut self, id: ResourceId) -> Result<(), StoreError> {
        self.working_mut()?.remove_resource(id)
    }

    /// Commits the pending mutations, returning the revision they became
    /// visible at. A clean transaction commits to the snapshot revision
    /// without issuing a new one.
    pub fn commit(mut self) -> Result<Revision, StoreError> {
        if self.state != TxState::Open {
            return Err(StoreError::IllegalState("transaction is no longer open"));
        }
        let working =
            self.working.take().ok_or(StoreError::IllegalState("transaction has no working copy"))?;
        let store = self.store;
        let inner = &store.inner;

        if !working.is_dirty() {
            self.state = TxState::Committed;
            self.release();
            return Ok(self.snapshot);
        }

        let issued = inner.pool.issue()?;
        let mut program = working.compile();
        program.commit(PhaseMask::ALL, inner.options.checksum(), issued.revision());

        let slot = self.slot.ok_or(StoreError::IllegalState("writer without a journal slot"))?;
        inner.journal.lock().write(slot, &program)?;

        // Past this point the program is durable; a failure leaves the slot
        // occupied and recovery finishes the job.
        self.state = TxState::Poisoned;
        inner.apply(&program, Phase::Commit)?;
        inner.pool.publish(issued)?;
        inner.apply(&program, Phase::Cleanup)?;
        self.state = TxState::Committed;

        inner.metrics.commit_program_bytes.record(program.len() as f64);
        inner.metrics.commit_commands.record(program.command_count(Phase::Commit) as f64);
        debug!("transaction {} committed {}", self.owner, issued.revision());

        self.release();
        // The commit is published; a failed sweep only defers reclamation.
        if let Err(e) = store.sweep() {
            warn!("post-commit sweep failed: {e}");
        }
        Ok(issued.revision())
    }
}

impl<'tx> Transaction<'tx, EX> {
    /// Deletes every path, link, resource and scratch file in the store.
    /// Exclusivity makes this safe to apply immediately, outside the journal:
    /// no other transaction holds a snapshot.
    pub fn purge(&mut self) -> Result<(), StoreError> {
        let working = self.working_mut()?;
        if working.is_dirty() {
            return Err(StoreError::IllegalState("purge requires no pending mutations"));
        }
        let node = working.node().clone();

        let store = self.store;
        let inner = &store.inner;
        for dir in [PATHS_DIR, LINKS_DIR, BLOBS_DIR, TMP_DIR] {
            let path = inner.root().join(dir);
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&path)?;
        }
        // The old working copy may cache facts about the deleted tree. The
        // fresh one is marked erased so the commit issues a new revision:
        // the pre-purge revision token must never describe the empty store.
        let mut working =
            WorkingCopy::new(&inner.indices, &inner.locks, self.owner, node, self.snapshot);
        working.mark_erased();
        self.working = Some(working);
        debug!("store purged");
        Ok(())
    }
}

impl<K: TransactionKind> Drop for Transaction<'_, K> {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            if let Err(e) = self.finish() {
                error!("rollback on drop failed: {e}");
            }
        } else if self.state == TxState::Poisoned {
            self.release();
        }
    }
}
