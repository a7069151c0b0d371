use crate::{
    error::StoreError,
    index::Indices,
    lock::{LockOwner, LockTable},
    path::{NodeId, QualifiedPath, ResourcePath},
    program::{Command, Phase, Program, ProgramBuilder},
    resource::ResourceId,
    revision::Revision,
};
use fxhash::FxHashMap;
use std::collections::BTreeSet;

/// Per-transaction view of the store: the snapshot the transaction reads at,
/// plus every mutation it has proposed so far.
///
/// Reads go straight to the durable indices at the snapshot revision; the
/// local caches hold only facts that a mutating operation has validated and
/// locked, so reads-after-writes observe the transaction's own pending
/// mutations. Every mutation validates its preconditions first, then
/// acquires the involved locks, and only then records itself in the caches
/// and in the program builder.
#[derive(Debug)]
pub struct WorkingCopy<'a> {
    indices: &'a Indices,
    locks: &'a LockTable,
    owner: LockOwner,
    node: NodeId,
    snapshot: Revision,
    paths: FxHashMap<QualifiedPath, Option<ResourceId>>,
    resources: FxHashMap<ResourceId, bool>,
    builder: ProgramBuilder,
}

impl<'a> WorkingCopy<'a> {
    pub fn new(
        indices: &'a Indices,
        locks: &'a LockTable,
        owner: LockOwner,
        node: NodeId,
        snapshot: Revision,
    ) -> Self {
        Self {
            indices,
            locks,
            owner,
            node,
            snapshot,
            paths: FxHashMap::default(),
            resources: FxHashMap::default(),
            builder: ProgramBuilder::new(),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    fn qualify(&self, path: &ResourcePath) -> Result<QualifiedPath, StoreError> {
        if path.is_wildcard() {
            return Err(StoreError::WildcardRejected(path.clone()));
        }
        Ok(path.qualify(&self.node))
    }

    fn resolve_qualified(&self, path: &QualifiedPath) -> Result<Option<ResourceId>, StoreError> {
        if let Some(local) = self.paths.get(path) {
            return Ok(*local);
        }
        Ok(self.indices.paths.get(path, self.snapshot)?.into_value())
    }

    /// The id linked at `path`, observing this transaction's own pending
    /// mutations.
    pub fn resolve(&self, path: &ResourcePath) -> Result<Option<ResourceId>, StoreError> {
        let qualified = self.qualify(path)?;
        self.resolve_qualified(&qualified)
    }

    pub fn resource_exists(&self, id: ResourceId) -> Result<bool, StoreError> {
        if let Some(local) = self.resources.get(&id) {
            return Ok(*local);
        }
        self.indices.links.exists(id, self.snapshot)
    }

    /// Child segments under `path`, merged with pending mutations. Wildcard
    /// paths list under their prefix.
    pub fn list(&self, path: &ResourcePath) -> Result<Vec<String>, StoreError> {
        let prefix = path.qualify(&self.node);
        let mut children: BTreeSet<String> =
            self.indices.paths.children(&prefix, self.snapshot)?.into_iter().collect();

        for (candidate, id) in &self.paths {
            if candidate.node() != prefix.node()
                || candidate.segments().len() != prefix.segments().len() + 1
                || !candidate.segments().starts_with(prefix.segments())
            {
                continue;
            }
            let segment = candidate.segments().last().expect("one segment deeper").clone();
            match id {
                Some(_) => {
                    children.insert(segment);
                }
                None => {
                    children.remove(&segment);
                }
            }
        }
        Ok(children.into_iter().collect())
    }

    fn linked_paths(&self, id: ResourceId) -> Result<BTreeSet<QualifiedPath>, StoreError> {
        let mut linked: BTreeSet<QualifiedPath> =
            self.indices.links.paths(id, self.snapshot)?.into_iter().collect();
        for (path, local) in &self.paths {
            match local {
                Some(local_id) if *local_id == id => {
                    linked.insert(path.clone());
                }
                _ => {
                    linked.remove(path);
                }
            }
        }
        Ok(linked)
    }

    /// Stages new content under a caller-chosen id and links it at `path`.
    pub fn link_new_resource(
        &mut self,
        path: &ResourcePath,
        id: ResourceId,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let qualified = self.qualify(path)?;
        if self.resolve_qualified(&qualified)?.is_some() {
            return Err(StoreError::DuplicatePath(path.clone()));
        }
        if self.resource_exists(id)? {
            return Err(StoreError::DuplicateResource(id));
        }
        self.locks.try_lock(qualified.clone(), self.owner)?;
        self.locks.try_lock(id, self.owner)?;

        let blob = self.indices.resources.stage(&id.to_string(), content)?;
        let entry = self.stage_path_entry(id)?;
        self.builder
            .link_file_to_resource(Phase::Commit, blob.clone(), id)
            .link_file_to_path(Phase::Commit, entry.clone(), qualified.clone())
            .link_resource_to_path(Phase::Commit, id, qualified.clone())
            .unlink_file(Phase::Cleanup, blob)
            .unlink_file(Phase::Cleanup, entry);

        self.paths.insert(qualified, Some(id));
        self.resources.insert(id, true);
        Ok(())
    }

    /// Stages new content under a fresh id and links it at `path`.
    pub fn save_new_resource(
        &mut self,
        path: &ResourcePath,
        content: &[u8],
    ) -> Result<ResourceId, StoreError> {
        let id = ResourceId::generate();
        self.link_new_resource(path, id, content)?;
        Ok(id)
    }

    /// Links an already existing resource at an additional `path`.
    pub fn link_existing_resource(
        &mut self,
        path: &ResourcePath,
        id: ResourceId,
    ) -> Result<(), StoreError> {
        let qualified = self.qualify(path)?;
        if self.resolve_qualified(&qualified)?.is_some() {
            return Err(StoreError::DuplicatePath(path.clone()));
        }
        if !self.resource_exists(id)? {
            return Err(StoreError::ResourceNotFound(id));
        }
        self.locks.try_lock(qualified.clone(), self.owner)?;
        self.locks.try_lock(id, self.owner)?;

        let entry = self.stage_path_entry(id)?;
        self.builder
            .link_file_to_path(Phase::Commit, entry.clone(), qualified.clone())
            .link_resource_to_path(Phase::Commit, id, qualified.clone())
            .unlink_file(Phase::Cleanup, entry);

        self.paths.insert(qualified, Some(id));
        Ok(())
    }

    /// Unlinks `path`, leaving the resource itself in place.
    pub fn unlink(&mut self, path: &ResourcePath) -> Result<(), StoreError> {
        let qualified = self.qualify(path)?;
        let id = self
            .resolve_qualified(&qualified)?
            .ok_or_else(|| StoreError::PathNotFound(path.clone()))?;
        self.locks.try_lock(qualified.clone(), self.owner)?;
        self.locks.try_lock(id, self.owner)?;

        if let Some(Some(_)) = self.paths.get(&qualified) {
            // The link being undone is itself pending in this transaction.
            self.builder.cancel_path(&qualified);
        } else {
            self.builder.unlink_path(Phase::Commit, qualified.clone());
        }
        self.paths.insert(qualified, None);
        Ok(())
    }

    /// Removes a resource: unlinks every path still pointing at it, then
    /// tombstones the resource itself.
    pub fn remove_resource(&mut self, id: ResourceId) -> Result<(), StoreError> {
        if !self.resource_exists(id)? {
            return Err(StoreError::ResourceNotFound(id));
        }
        let linked = self.linked_paths(id)?;
        self.locks.try_lock(id, self.owner)?;
        for path in &linked {
            self.locks.try_lock(path.clone(), self.owner)?;
        }

        for path in &linked {
            if let Some(Some(_)) = self.paths.get(path) {
                self.builder.cancel_path(path);
            } else {
                self.builder.unlink_path(Phase::Commit, path.clone());
            }
            self.paths.insert(path.clone(), None);
        }
        self.builder.remove_resource(Phase::Commit, id);
        self.resources.insert(id, false);
        Ok(())
    }

    /// Writes a path-index entry payload for `id` into the scratch area, so
    /// the commit program can install it with an atomic rename.
    fn stage_path_entry(&self, id: ResourceId) -> Result<String, StoreError> {
        let token = ResourceId::generate();
        self.indices
            .resources
            .stage(&format!("{token}.ent"), &crate::index::entry::encode(false, Some(id)))
    }

    /// Records a store-wide erasure that already happened outside the
    /// program, so the commit still issues and publishes a revision for it.
    pub fn mark_erased(&mut self) {
        self.builder.push(Phase::Commit, Command::Noop);
    }

    pub fn is_dirty(&self) -> bool {
        !self.builder.is_empty()
    }

    /// Compiles the accumulated mutations into an uncommitted program.
    pub fn compile(self) -> Program {
        self.builder.compile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        indices: Indices,
        locks: LockTable,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        for sub in ["paths", "links", "blobs", "tmp"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let indices = Indices::new(dir.path());
        Fixture { _dir: dir, indices, locks: LockTable::new() }
    }

    fn node(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    fn rpath(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn working<'a>(fx: &'a Fixture, owner: LockOwner, snapshot: u64) -> WorkingCopy<'a> {
        WorkingCopy::new(&fx.indices, &fx.locks, owner, node("alpha"), Revision::new(snapshot))
    }

    #[test]
    fn test_read_your_writes() {
        let fx = fixture();
        let mut wc = working(&fx, 1, 0);

        assert_eq!(wc.resolve(&rpath("/a")).unwrap(), None);
        let id = wc.save_new_resource(&rpath("/a"), b"content").unwrap();
        assert_eq!(wc.resolve(&rpath("/a")).unwrap(), Some(id));
        assert!(wc.resource_exists(id).unwrap());
        assert_eq!(wc.list(&rpath("/*")).unwrap(), ["a"]);

        wc.unlink(&rpath("/a")).unwrap();
        assert_eq!(wc.resolve(&rpath("/a")).unwrap(), None);
        assert!(wc.list(&rpath("/*")).unwrap().is_empty());
    }

    #[test]
    fn test_preconditions() {
        let fx = fixture();
        let mut wc = working(&fx, 1, 0);
        let id = wc.save_new_resource(&rpath("/a"), b"x").unwrap();

        // Destination must be free.
        assert!(matches!(
            wc.link_existing_resource(&rpath("/a"), id),
            Err(StoreError::DuplicatePath(_))
        ));
        assert!(matches!(
            wc.link_new_resource(&rpath("/a"), ResourceId::generate(), b"y"),
            Err(StoreError::DuplicatePath(_))
        ));
        // New ids must be new, existing ids must exist.
        assert!(matches!(
            wc.link_new_resource(&rpath("/b"), id, b"y"),
            Err(StoreError::DuplicateResource(_))
        ));
        assert!(matches!(
            wc.link_existing_resource(&rpath("/b"), ResourceId::generate()),
            Err(StoreError::ResourceNotFound(_))
        ));
        assert!(matches!(wc.unlink(&rpath("/b")), Err(StoreError::PathNotFound(_))));
        assert!(matches!(
            wc.remove_resource(ResourceId::generate()),
            Err(StoreError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_wildcards_rejected_by_mutations() {
        let fx = fixture();
        let mut wc = working(&fx, 1, 0);
        assert!(matches!(
            wc.save_new_resource(&rpath("/a/*"), b"x"),
            Err(StoreError::WildcardRejected(_))
        ));
        assert!(matches!(wc.unlink(&rpath("/a/*")), Err(StoreError::WildcardRejected(_))));
        assert!(matches!(wc.resolve(&rpath("/a/*")), Err(StoreError::WildcardRejected(_))));
    }

    #[test]
    fn test_conflicting_transactions_fail_fast() {
        let fx = fixture();
        let mut first = working(&fx, 1, 0);
        let mut second = working(&fx, 2, 0);

        first.save_new_resource(&rpath("/a"), b"x").unwrap();
        let err = second.save_new_resource(&rpath("/a"), b"y").unwrap_err();
        assert!(err.is_retryable());

        // Disjoint paths proceed in parallel.
        second.save_new_resource(&rpath("/b"), b"y").unwrap();
    }

    /// Writes a live path entry and its reverse link directly into the
    /// indices, standing in for a commit at `revision`.
    fn link_on_disk(fx: &Fixture, path: &str, id: ResourceId, revision: u64) {
        let qualified = QualifiedPath::parse(path).unwrap();
        let revision = Revision::new(revision);
        crate::index::entry::write(
            &fx.indices.paths.dir_for(&qualified),
            revision,
            &crate::index::entry::encode(false, Some(id)),
        )
        .unwrap();
        fx.indices.links.link(id, &qualified, revision).unwrap();
    }

    #[test]
    fn test_remove_resource_unlinks_everything() {
        let fx = fixture();
        let id = ResourceId::generate();
        fx.indices.links.mark_created(id, Revision::new(1)).unwrap();
        link_on_disk(&fx, "alpha:/a", id, 1);
        link_on_disk(&fx, "alpha:/b", id, 1);

        let mut wc = working(&fx, 1, 1);
        wc.remove_resource(id).unwrap();
        assert_eq!(wc.resolve(&rpath("/a")).unwrap(), None);
        assert_eq!(wc.resolve(&rpath("/b")).unwrap(), None);
        assert!(!wc.resource_exists(id).unwrap());

        let program = wc.compile();
        let commit = program.commands(Phase::Commit).unwrap();
        let unlinks = commit
            .iter()
            .filter(|c| matches!(c, Command::UnlinkPath { .. }))
            .count();
        assert_eq!(unlinks, 2);
        assert!(commit.iter().any(|c| matches!(c, Command::RemoveResource { id: r } if *r == id)));
    }

    #[test]
    fn test_undoing_a_pending_link_cancels_it() {
        let fx = fixture();
        let mut wc = working(&fx, 1, 0);
        let id = wc.save_new_resource(&rpath("/a"), b"x").unwrap();
        wc.unlink(&rpath("/a")).unwrap();

        let commit = wc.compile().commands(Phase::Commit).unwrap();
        // The staged link is dropped outright; no unlink reaches the program.
        assert!(commit.iter().all(|c| !matches!(
            c,
            Command::UnlinkPath { .. }
                | Command::LinkFileToPath { .. }
                | Command::LinkResourceToPath { .. }
        )));
        // The resource itself is still created, just never linked.
        assert!(commit.iter().any(|c| matches!(c, Command::LinkFileToResource { id: r, .. } if *r == id)));
    }

    #[test]
    fn test_relink_orders_unlink_before_link() {
        let fx = fixture();
        let old = ResourceId::generate();
        fx.indices.links.mark_created(old, Revision::new(1)).unwrap();
        link_on_disk(&fx, "alpha:/a", old, 1);

        let mut wc = working(&fx, 1, 1);
        wc.unlink(&rpath("/a")).unwrap();
        wc.save_new_resource(&rpath("/a"), b"v2").unwrap();

        let commit = wc.compile().commands(Phase::Commit).unwrap();
        let unlink = commit
            .iter()
            .position(|c| matches!(c, Command::UnlinkPath { .. }))
            .expect("relink keeps the unlink of the on-disk entry");
        let link = commit
            .iter()
            .position(|c| matches!(c, Command::LinkFileToPath { .. }))
            .expect("relink stages a new entry");
        assert!(unlink < link);
    }

    #[test]
    fn test_mark_erased_dirties_a_clean_copy() {
        let fx = fixture();
        let mut wc = working(&fx, 1, 0);
        assert!(!wc.is_dirty());

        wc.mark_erased();
        assert!(wc.is_dirty());
        let commit = wc.compile().commands(Phase::Commit).unwrap();
        assert_eq!(commit, vec![Command::Noop]);
    }

    #[test]
    fn test_clean_copy_compiles_empty() {
        let fx = fixture();
        let wc = working(&fx, 1, 0);
        assert!(!wc.is_dirty());
        assert!(wc.compile().is_empty());
    }
}
