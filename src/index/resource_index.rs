use crate::{error::StoreError, resource::ResourceId};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

pub const BLOBS_DIR: &str = "blobs";
pub const TMP_DIR: &str = "tmp";

/// Content store: immutable blobs under `blobs/`, staged writes under `tmp/`.
///
/// New content is first written durably into the scratch area and only moved
/// into `blobs/` by the transaction's commit program (a rename, so a blob is
/// either fully present or not at all). Scratch files and commands refer to
/// files by store-root-relative name so programs replay identically after a
/// restart.
#[derive(Debug, Clone)]
pub struct ResourceIndex {
    root: PathBuf,
}

impl ResourceIndex {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn blob_path(&self, id: ResourceId) -> PathBuf {
        self.root.join(BLOBS_DIR).join(id.to_string())
    }

    fn resolve_scratch(&self, file: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(file);
        let mut components = relative.components();
        let under_tmp = components.next()
            == Some(std::path::Component::Normal(TMP_DIR.as_ref()))
            && components.all(|c| matches!(c, std::path::Component::Normal(_)));
        if !under_tmp {
            return Err(StoreError::IllegalState("scratch file outside the tmp directory"));
        }
        Ok(self.root.join(relative))
    }

    /// Durably writes `bytes` into the scratch area under `name`, returning
    /// the store-root-relative file name for use in program commands.
    pub fn stage(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let relative = format!("{TMP_DIR}/{name}");
        let absolute = self.resolve_scratch(&relative)?;
        fs::create_dir_all(absolute.parent().expect("scratch files live under tmp"))?;
        let mut file = fs::File::create(&absolute)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(relative)
    }

    pub fn scratch_path(&self, file: &str) -> Result<PathBuf, StoreError> {
        self.resolve_scratch(file)
    }

    /// Moves a staged file into `blobs/` as the content of `id`.
    /// Replay-idempotent like the index entry installs.
    pub fn promote(&self, file: &str, id: ResourceId) -> Result<(), StoreError> {
        let source = self.resolve_scratch(file)?;
        let destination = self.blob_path(id);
        fs::create_dir_all(destination.parent().expect("blob files live under blobs"))?;
        match fs::rename(&source, &destination) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && destination.exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the content of `id`. The caller asserts the resource exists, so
    /// a missing blob is `ResourceNotFound`, not an absent value.
    pub fn read(&self, id: ResourceId) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::ResourceNotFound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a scratch file; already gone is fine (cleanup replays).
    pub fn remove_scratch(&self, file: &str) -> Result<(), StoreError> {
        let absolute = self.resolve_scratch(file)?;
        match fs::remove_file(&absolute) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
