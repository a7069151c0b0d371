use crate::{
    error::{FatalError, StoreError},
    index::entry,
    path::QualifiedPath,
    resource::ResourceId,
    revision::Revision,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

const SELF_DIR: &str = "self";
const PATHS_DIR: &str = "paths";

/// Reverse index: resource id → existence and linked paths, versioned per
/// revision.
///
/// Each resource owns a directory `links/<id hex>/` with two kinds of entry
/// directories inside: `self/` tracks the resource's own lifetime
/// (created/removed), and `paths/<escaped qualified path>/` tracks each
/// link/unlink. Paths are stored single-component escaped so the whole
/// qualified form fits one directory name.
#[derive(Debug, Clone)]
pub struct ReverseIndex {
    root: PathBuf,
}

impl ReverseIndex {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn dir_for(&self, id: ResourceId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn self_dir(&self, id: ResourceId) -> PathBuf {
        self.dir_for(id).join(SELF_DIR)
    }

    fn path_dir(&self, id: ResourceId, path: &QualifiedPath) -> PathBuf {
        self.dir_for(id).join(PATHS_DIR).join(path.escaped())
    }

    fn live_at(dir: &Path, revision: Revision) -> Result<bool, StoreError> {
        match entry::latest_at(dir, revision)? {
            None => Ok(false),
            Some((_, bytes)) => Ok(!entry::decode(&bytes)?.0),
        }
    }

    /// Whether the resource exists (created and not removed) at `revision`.
    pub fn exists(&self, id: ResourceId, revision: Revision) -> Result<bool, StoreError> {
        Self::live_at(&self.self_dir(id), revision)
    }

    pub fn mark_created(&self, id: ResourceId, revision: Revision) -> Result<(), StoreError> {
        entry::write(&self.self_dir(id), revision, &entry::encode(false, None))
    }

    pub fn mark_removed(&self, id: ResourceId, revision: Revision) -> Result<(), StoreError> {
        entry::write(&self.self_dir(id), revision, &entry::encode(true, None))
    }

    pub fn link(
        &self,
        id: ResourceId,
        path: &QualifiedPath,
        revision: Revision,
    ) -> Result<(), StoreError> {
        entry::write(&self.path_dir(id, path), revision, &entry::encode(false, None))
    }

    pub fn unlink(
        &self,
        id: ResourceId,
        path: &QualifiedPath,
        revision: Revision,
    ) -> Result<(), StoreError> {
        entry::write(&self.path_dir(id, path), revision, &entry::encode(true, None))
    }

    /// All paths linked to `id` as of `revision`.
    pub fn paths(
        &self,
        id: ResourceId,
        revision: Revision,
    ) -> Result<Vec<QualifiedPath>, StoreError> {
        let dir = self.dir_for(id).join(PATHS_DIR);
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for dirent in read {
            let dirent = dirent?;
            let name = dirent.file_name();
            let escaped = name
                .to_str()
                .ok_or(FatalError::Malformed("reverse index directory name"))?;
            if Self::live_at(&dirent.path(), revision)? {
                let path = QualifiedPath::unescape(escaped)
                    .map_err(|_| FatalError::Malformed("reverse index directory name"))?;
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Superseded entry files for `id` (self and per-path) as of `revision`.
    pub fn superseded(
        &self,
        id: ResourceId,
        revision: Revision,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = entry::superseded_at(&self.self_dir(id), revision)?;
        let paths_dir = self.dir_for(id).join(PATHS_DIR);
        match fs::read_dir(&paths_dir) {
            Ok(read) => {
                for dirent in read {
                    files.extend(entry::superseded_at(&dirent?.path(), revision)?);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(files)
    }
}
