use crate::{error::StoreError, path::QualifiedPath, resource::ResourceId};
use dashmap::{mapref::entry::Entry, DashMap};
use log::trace;
use std::fmt;

/// Identifier of the transaction holding a lock.
pub type LockOwner = u64;

/// A lockable entity: a qualified path or a resource id.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum LockKey {
    Path(QualifiedPath),
    Resource(ResourceId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "path {path}"),
            Self::Resource(id) => write!(f, "resource {id}"),
        }
    }
}

impl From<QualifiedPath> for LockKey {
    fn from(path: QualifiedPath) -> Self {
        Self::Path(path)
    }
}

impl From<ResourceId> for LockKey {
    fn from(id: ResourceId) -> Self {
        Self::Resource(id)
    }
}

/// Transient, transaction-scoped lock table for optimistic concurrency.
///
/// Locks exist only in memory and only for the lifetime of in-flight
/// transactions; nothing here is persisted. Acquisition never blocks: a key
/// held by another transaction fails immediately with a retryable
/// [`StoreError::Conflict`], and the caller is expected to abort and retry
/// the whole transaction. Acquisition is re-entrant for the owning
/// transaction.
#[derive(Default, Debug)]
pub struct LockTable {
    held: DashMap<LockKey, LockOwner, fxhash::FxBuildHasher>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take `key` for `owner` without blocking.
    pub fn try_lock(&self, key: impl Into<LockKey>, owner: LockOwner) -> Result<(), StoreError> {
        let key = key.into();
        match self.held.entry(key.clone()) {
            Entry::Vacant(entry) => {
                trace!("tx {owner} locked {key}");
                entry.insert(owner);
                Ok(())
            }
            Entry::Occupied(entry) if *entry.get() == owner => Ok(()),
            Entry::Occupied(_) => Err(StoreError::Conflict(key)),
        }
    }

    pub fn holds(&self, key: &LockKey, owner: LockOwner) -> bool {
        self.held.get(key).map(|held_by| *held_by == owner).unwrap_or(false)
    }

    /// Drops every lock held by `owner`; called on commit and rollback.
    pub fn release_all(&self, owner: LockOwner) {
        self.held.retain(|_, held_by| *held_by != owner);
        trace!("tx {owner} released its locks");
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
