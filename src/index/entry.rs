//! Revisioned entry files shared by the path and reverse-path indices.
//!
//! Each indexed key owns a directory; every mutation of the key appends one
//! entry file named after the mutating revision (`<revision, zero padded to
//! 20 digits>.ent`). The MVCC read rule picks, among all entries in the
//! directory, the one with the highest revision at or below the requested
//! snapshot. Removal is a tombstone entry, not a deletion; physical deletion
//! of superseded entries is the garbage collector's job.

use crate::{
    error::{FatalError, StoreError},
    resource::ResourceId,
    revision::Revision,
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

const EXT: &str = "ent";
const LIVE: u8 = 0;
const TOMBSTONE: u8 = 1;

pub fn file_name(revision: Revision) -> String {
    format!("{:020}.{EXT}", revision.as_u64())
}

/// Parses a revision back out of an entry file name; `None` for foreign
/// files.
pub fn revision_of(name: &str) -> Option<Revision> {
    let digits = name.strip_suffix(&format!(".{EXT}"))?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(Revision::new)
}

/// Serializes an entry payload: a tombstone flag optionally followed by a
/// resource id.
pub fn encode(tombstone: bool, id: Option<ResourceId>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + ResourceId::LEN);
    bytes.push(if tombstone { TOMBSTONE } else { LIVE });
    if let Some(id) = id {
        bytes.extend_from_slice(id.as_bytes());
    }
    bytes
}

pub fn decode(bytes: &[u8]) -> Result<(bool, Option<ResourceId>), FatalError> {
    let tombstone = match bytes.first() {
        Some(&LIVE) => false,
        Some(&TOMBSTONE) => true,
        _ => return Err(FatalError::Malformed("index entry flag")),
    };
    let id = match bytes.len() {
        1 => None,
        _ => {
            let raw: [u8; ResourceId::LEN] = bytes[1..]
                .try_into()
                .map_err(|_| FatalError::Malformed("index entry resource id"))?;
            Some(ResourceId::from_bytes(raw))
        }
    };
    Ok((tombstone, id))
}

/// Durably writes one entry file. Overwrites an existing entry for the same
/// revision, which makes replay of a commit program idempotent.
pub fn write(dir: &Path, revision: Revision, bytes: &[u8]) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    let mut file = fs::File::create(dir.join(file_name(revision)))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Finds the latest entry in `dir` with revision at or below `revision` and
/// returns its revision and payload. A missing directory means no entry was
/// ever written.
pub fn latest_at(dir: &Path, revision: Revision) -> Result<Option<(Revision, Vec<u8>)>, StoreError> {
    let mut best: Option<Revision> = None;
    for name in list_entries(dir)? {
        if name <= revision && best.map(|b| name > b).unwrap_or(true) {
            best = Some(name);
        }
    }
    match best {
        Some(found) => {
            let bytes = fs::read(dir.join(file_name(found)))?;
            Ok(Some((found, bytes)))
        }
        None => Ok(None),
    }
}

/// Entry files in `dir` superseded as of `revision`: everything older than
/// the newest entry at or below it. These are candidates for GC scheduling.
pub fn superseded_at(dir: &Path, revision: Revision) -> Result<Vec<PathBuf>, StoreError> {
    let entries = list_entries(dir)?;
    let newest = entries.iter().copied().filter(|r| *r <= revision).max();
    let Some(newest) = newest else { return Ok(Vec::new()) };
    Ok(entries
        .into_iter()
        .filter(|r| *r < newest)
        .map(|r| dir.join(file_name(r)))
        .collect())
}

fn list_entries(dir: &Path) -> Result<Vec<Revision>, StoreError> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut revisions = Vec::new();
    for dirent in read {
        let dirent = dirent?;
        if let Some(revision) = dirent.file_name().to_str().and_then(revision_of) {
            revisions.push(revision);
        }
    }
    Ok(revisions)
}
