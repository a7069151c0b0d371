//! Durable indices answering "what is the value of key K at revision R".
//!
//! All three indices share the MVCC read rule: among the on-disk entries for
//! a key, the answer is the latest one whose own revision is at or below the
//! requested snapshot. No qualifying entry is an explicit absent result,
//! never an error; removal is a tombstone entry.

pub mod entry;
mod path_index;
mod resource_index;
mod reverse_index;

pub use path_index::PathIndex;
pub use resource_index::{ResourceIndex, BLOBS_DIR, TMP_DIR};
pub use reverse_index::ReverseIndex;

use crate::{error::StoreError, resource::ResourceId, revision::Revision};
use std::path::{Path, PathBuf};

pub const PATHS_DIR: &str = "paths";
pub const LINKS_DIR: &str = "links";

/// The three durable indices of one store root, constructed together.
#[derive(Debug, Clone)]
pub struct Indices {
    pub paths: PathIndex,
    pub links: ReverseIndex,
    pub resources: ResourceIndex,
}

impl Indices {
    pub fn new(root: &Path) -> Self {
        Self {
            paths: PathIndex::new(root.join(PATHS_DIR)),
            links: ReverseIndex::new(root.join(LINKS_DIR)),
            resources: ResourceIndex::new(root.to_path_buf()),
        }
    }

    /// Every entry file superseded for `id` and its links as of `revision`,
    /// plus the blob itself when the resource was removed by then: the file
    /// set a remove at `revision` makes eligible for collection.
    pub fn removal_garbage(
        &self,
        id: ResourceId,
        revision: Revision,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = self.links.superseded(id, revision)?;
        if !self.links.exists(id, revision)? {
            files.push(self.resources.blob_path(id));
        }
        Ok(files)
    }
}
