//! A transactional, revisioned resource store backed by the filesystem.
//!
//! Resources are content blobs addressed by id and linked at hierarchical
//! paths. Every commit produces a new immutable revision; readers observe
//! the store as of the revision current when their transaction began, and
//! writers buffer mutations into a checksummed program that is journaled
//! before it is applied, so a crash at any point either replays or discards
//! the whole commit.

pub mod block;
pub mod config;
pub mod counter;
pub mod error;
pub mod gc;
pub mod index;
pub mod journal;
pub mod lock;
pub mod metrics;
pub mod path;
pub mod pool;
pub mod program;
pub mod resource;
pub mod revision;
pub mod store;
pub mod table;
pub mod transaction;
mod working;

pub use config::StoreOptions;
pub use error::{FatalError, StoreError};
pub use path::{NodeId, ResourcePath};
pub use resource::ResourceId;
pub use revision::Revision;
pub use store::Store;
pub use transaction::{Transaction, EX, RO, RW};
