use crate::{
    error::{FatalError, StoreError},
    index::entry,
    path::QualifiedPath,
    resource::ResourceId,
    revision::{Revision, Revisioned},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Forward index: qualified path → resource id, versioned per revision.
///
/// The symbolic hierarchy is mirrored as directories under `paths/`
/// (node first, then one directory per segment); each directory holds the
/// revisioned entry files for the path it denotes. Segment characters are
/// restricted at parse time, so path components map to directory names
/// verbatim.
#[derive(Debug, Clone)]
pub struct PathIndex {
    root: PathBuf,
}

impl PathIndex {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn dir_for(&self, path: &QualifiedPath) -> PathBuf {
        let mut dir = self.root.clone();
        for component in path.fs_components() {
            dir.push(component);
        }
        dir
    }

    /// MVCC lookup: the id linked at `path` as of `revision`, or an absent
    /// result if the path was never linked or tombstoned by then.
    pub fn get(
        &self,
        path: &QualifiedPath,
        revision: Revision,
    ) -> Result<Revisioned<ResourceId>, StoreError> {
        match entry::latest_at(&self.dir_for(path), revision)? {
            None => Ok(Revisioned::absent(Revision::ZERO)),
            Some((found, bytes)) => {
                let (tombstone, id) = entry::decode(&bytes)?;
                if tombstone {
                    return Ok(Revisioned::new(found, None));
                }
                let id = id.ok_or(FatalError::Malformed("path entry without resource id"))?;
                Ok(Revisioned::new(found, Some(id)))
            }
        }
    }

    /// Installs a pre-serialized entry file by renaming `source` into place.
    /// Replay-idempotent: a missing source with the destination already
    /// present means the rename already happened.
    pub fn install(
        &self,
        path: &QualifiedPath,
        revision: Revision,
        source: &Path,
    ) -> Result<(), StoreError> {
        let dir = self.dir_for(path);
        fs::create_dir_all(&dir)?;
        let destination = dir.join(entry::file_name(revision));
        match fs::rename(source, &destination) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && destination.exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a tombstone entry for `path` at `revision`. The tombstone
    /// carries the id it displaced (when known) so replaying the unlink can
    /// find the reverse-index entry to tombstone as well.
    pub fn remove(
        &self,
        path: &QualifiedPath,
        revision: Revision,
        id: Option<ResourceId>,
    ) -> Result<(), StoreError> {
        entry::write(&self.dir_for(path), revision, &entry::encode(true, id))
    }

    /// The raw newest entry at or below `revision`: its revision, tombstone
    /// flag and id. Unlike [`get`](Self::get) this exposes tombstones, which
    /// the command interpreter needs for idempotent replay.
    pub fn entry_at(
        &self,
        path: &QualifiedPath,
        revision: Revision,
    ) -> Result<Option<(Revision, bool, Option<ResourceId>)>, StoreError> {
        match entry::latest_at(&self.dir_for(path), revision)? {
            None => Ok(None),
            Some((found, bytes)) => {
                let (tombstone, id) = entry::decode(&bytes)?;
                Ok(Some((found, tombstone, id)))
            }
        }
    }

    /// Child segments of `path` that are live at `revision`.
    pub fn children(
        &self,
        path: &QualifiedPath,
        revision: Revision,
    ) -> Result<Vec<String>, StoreError> {
        let dir = self.dir_for(path);
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        for dirent in read {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let Some(segment) = dirent.file_name().to_str().map(str::to_owned) else { continue };
            let child = path
                .child(&segment)
                .map_err(|_| FatalError::Malformed("path index directory name"))?;
            if self.get(&child, revision)?.value().is_some() {
                children.push(segment);
            }
        }
        children.sort();
        Ok(children)
    }

    /// Entry files for `path` superseded as of `revision` (GC candidates).
    pub fn superseded(
        &self,
        path: &QualifiedPath,
        revision: Revision,
    ) -> Result<Vec<PathBuf>, StoreError> {
        entry::superseded_at(&self.dir_for(path), revision)
    }
}
