use crate::{
    error::StoreError,
    revision::Revision,
    table::{RevisionRecord, RevisionTable},
};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A revision issued by the pool but not yet published. Carries the table
/// slot its record occupies so the commit path can flip the published flag.
#[derive(Copy, Clone, Debug)]
pub struct IssuedRevision {
    revision: Revision,
    slot: u32,
}

impl IssuedRevision {
    pub fn revision(&self) -> Revision {
        self.revision
    }
}

/// Sole issuer of revisions.
///
/// Issuance funnels through the revision table's dual counter, so revision
/// numbers are strictly increasing, within a run and across restarts: the
/// pool anchors its numbering on the newest record found in the table at
/// open, which includes revisions that were issued but never published
/// before a crash (those are rolled back, never reused).
///
/// The *published* revision trails issuance: it advances only after a
/// commit's effects are durably applied, and is what new transactions
/// observe as their snapshot.
#[derive(Debug)]
pub struct RevisionPool {
    table: Mutex<RevisionTable>,
    /// Free-running leading count corresponding to `origin_revision`.
    origin_leading: u32,
    origin_revision: u64,
    published: AtomicU64,
}

impl RevisionPool {
    /// Restores the pool position from the table. The published revision is
    /// the newest record flagged as published; `Revision::ZERO` for a fresh
    /// store.
    pub fn open(table: RevisionTable) -> Result<Self, StoreError> {
        let (origin_leading, origin_revision) = match table.latest() {
            Some(record) => (record.leading(), record.revision().as_u64()),
            None => (0, 0),
        };
        let published =
            table.latest_published()?.map(|record| record.revision().as_u64()).unwrap_or(0);
        debug!(
            "revision pool restored: published r{published}, issuance resumes after r{origin_revision}"
        );
        Ok(Self {
            table: Mutex::new(table),
            origin_leading,
            origin_revision,
            published: AtomicU64::new(published),
        })
    }

    /// The newest published revision; the snapshot for new transactions.
    pub fn current(&self) -> Revision {
        Revision::new(self.published.load(Ordering::Acquire))
    }

    fn revision_at(&self, leading: u32) -> Revision {
        let distance = leading.wrapping_sub(self.origin_leading) as u64;
        Revision::new(self.origin_revision + distance)
    }

    /// Issues the next revision and durably records it in the table. The
    /// revision is not visible to readers until [`publish`](Self::publish).
    pub fn issue(&self) -> Result<IssuedRevision, StoreError> {
        let mut table = self.table.lock();
        let (slot, leading) = table.issue_slot()?;
        let revision = self.revision_at(leading);
        let snapshot = table.counter_snapshot();
        table.write(slot, RevisionRecord::new(revision, snapshot))?;
        debug!("issued {revision} in table slot {slot}");
        Ok(IssuedRevision { revision, slot })
    }

    /// Makes an issued revision visible, called after the commit program's
    /// effects are fully applied. Concurrent commits with disjoint key sets
    /// may publish out of issuance order, so the published watermark only
    /// ever moves forward.
    pub fn publish(&self, issued: IssuedRevision) -> Result<(), StoreError> {
        let mut table = self.table.lock();
        table.mark_published(issued.slot, issued.revision)?;
        self.published.fetch_max(issued.revision.as_u64(), Ordering::AcqRel);
        debug!("published {}", issued.revision);
        Ok(())
    }

    /// Re-publishes a revision whose fully-committed program was replayed
    /// during journal recovery: the commit was durable, so the revision must
    /// become visible even though the original publish never ran.
    pub fn publish_recovered(&self, revision: Revision) -> Result<(), StoreError> {
        let mut table = self.table.lock();
        if let Some(slot) = table.find_slot(revision)? {
            table.mark_published(slot, revision)?;
        }
        self.published.fetch_max(revision.as_u64(), Ordering::AcqRel);
        debug!("published {revision} after recovery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_issue_publish_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");
        let pool = RevisionPool::open(RevisionTable::create(&path, 8).unwrap()).unwrap();

        assert_eq!(pool.current(), Revision::ZERO);

        let first = pool.issue().unwrap();
        assert_eq!(first.revision(), Revision::new(1));
        // Issued but unpublished revisions stay invisible.
        assert_eq!(pool.current(), Revision::ZERO);

        pool.publish(first).unwrap();
        assert_eq!(pool.current(), Revision::new(1));

        let second = pool.issue().unwrap();
        assert_eq!(second.revision(), Revision::new(2));
        pool.publish(second).unwrap();
        assert_eq!(pool.current(), Revision::new(2));
    }

    #[test]
    fn test_out_of_order_publication_never_regresses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");
        let pool = RevisionPool::open(RevisionTable::create(&path, 8).unwrap()).unwrap();

        let first = pool.issue().unwrap();
        let second = pool.issue().unwrap();

        // Disjoint commits may finish applying in either order.
        pool.publish(second).unwrap();
        assert_eq!(pool.current(), Revision::new(2));
        pool.publish(first).unwrap();
        assert_eq!(pool.current(), Revision::new(2));
    }

    #[test]
    fn test_numbering_resumes_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");

        {
            let pool = RevisionPool::open(RevisionTable::create(&path, 4).unwrap()).unwrap();
            for _ in 0..3 {
                let issued = pool.issue().unwrap();
                pool.publish(issued).unwrap();
            }
            // Issued, never published: simulates a crash mid-commit.
            assert_eq!(pool.issue().unwrap().revision(), Revision::new(4));
        }

        let pool = RevisionPool::open(RevisionTable::open(&path, 4).unwrap()).unwrap();
        // The interrupted revision 4 is burned, not reused.
        assert_eq!(pool.current(), Revision::new(3));
        assert_eq!(pool.issue().unwrap().revision(), Revision::new(5));
    }

    #[test]
    fn test_numbering_survives_ring_wrap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");
        let pool = RevisionPool::open(RevisionTable::create(&path, 2).unwrap()).unwrap();

        for expected in 1..=10u64 {
            let issued = pool.issue().unwrap();
            assert_eq!(issued.revision(), Revision::new(expected));
            pool.publish(issued).unwrap();
        }
    }
}
