use crate::{
    block::BlockBuffer,
    counter::CounterSnapshot,
    error::{FatalError, StoreError},
    revision::Revision,
};
use log::{debug, info};
use memmap2::MmapMut;
use std::{fs::OpenOptions, path::Path};
use zerocopy::{
    byteorder::little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Pattern filling slots that were never written.
const SENTINEL: u8 = 0xff;

const OFF_MAGIC: usize = 0;
const OFF_MAJOR: usize = 4;
const OFF_MINOR: usize = 6;
const OFF_SLOT_COUNT: usize = 8;

/// One persisted revision issuance: the revision number plus the issuing
/// counter's state at that moment. 24 bytes on disk.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, Debug)]
pub struct RevisionRecord {
    revision: U64,
    leading: U32,
    trailing: U32,
    max: U32,
    flags: U32,
}

impl RevisionRecord {
    const PUBLISHED: u32 = 1;

    pub fn new(revision: Revision, snapshot: CounterSnapshot) -> Self {
        Self {
            revision: U64::new(revision.as_u64()),
            leading: U32::new(snapshot.leading()),
            trailing: U32::new(snapshot.trailing()),
            max: U32::new(snapshot.max()),
            flags: U32::new(0),
        }
    }

    pub fn revision(&self) -> Revision {
        Revision::new(self.revision.get())
    }

    pub fn leading(&self) -> u32 {
        self.leading.get()
    }

    pub fn counter_snapshot(&self) -> CounterSnapshot {
        CounterSnapshot::new(self.max.get(), self.leading.get(), self.trailing.get())
    }

    pub fn is_published(&self) -> bool {
        self.flags.get() & Self::PUBLISHED != 0
    }

    fn publish(&mut self) {
        self.flags = U32::new(self.flags.get() | Self::PUBLISHED);
    }
}

/// Memory-mapped, versioned file persisting the revision issuance history as
/// a bounded ring of [`RevisionRecord`] slots.
///
/// The ring retains the most recent `slot_count` issuances; the newest record
/// is the restore point for the revision pool after a restart. Unused slots
/// hold the sentinel pattern (`0xff` bytes); evicted slots are cleared to the
/// block filler. The file may grow across restarts (new slots appended,
/// sentinel-filled) but never shrink: opening with fewer configured slots
/// than on disk is fatal.
#[derive(Debug)]
pub struct RevisionTable {
    buffer: BlockBuffer,
    slot_count: u32,
    latest: Option<RevisionRecord>,
}

impl RevisionTable {
    pub const MAGIC: [u8; 4] = *b"RVTB";
    pub const MAJOR: u16 = 1;
    pub const MINOR: u16 = 0;
    pub const HEADER_LEN: usize = 16;
    pub const SLOT_SIZE: usize = std::mem::size_of::<RevisionRecord>();

    fn file_len(slot_count: u32) -> u64 {
        (Self::HEADER_LEN + Self::SLOT_SIZE * slot_count as usize) as u64
    }

    fn write_header(mmap: &mut MmapMut, slot_count: u32) {
        mmap[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&Self::MAGIC);
        mmap[OFF_MAJOR..OFF_MAJOR + 2].copy_from_slice(&Self::MAJOR.to_le_bytes());
        mmap[OFF_MINOR..OFF_MINOR + 2].copy_from_slice(&Self::MINOR.to_le_bytes());
        mmap[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4].copy_from_slice(&slot_count.to_le_bytes());
        mmap[OFF_SLOT_COUNT + 4..Self::HEADER_LEN].fill(0);
    }

    /// Creates a fresh table file with all slots sentinel-filled.
    pub fn create(path: &Path, slot_count: u32) -> Result<Self, StoreError> {
        assert!(slot_count > 0, "revision table needs at least one slot");
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.set_len(Self::file_len(slot_count))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        Self::write_header(&mut mmap, slot_count);
        mmap[Self::HEADER_LEN..].fill(SENTINEL);
        mmap.flush()?;
        debug!("created revision table at {} with {slot_count} slots", path.display());

        let buffer =
            BlockBuffer::new(mmap, Self::HEADER_LEN, Self::SLOT_SIZE, slot_count)?;
        Ok(Self { buffer, slot_count, latest: None })
    }

    /// Opens an existing table, validating magic/version/slot count and
    /// restoring the ring position from the newest live record. A larger
    /// configured `slot_count` expands the file in place; a smaller one is
    /// fatal.
    pub fn open(path: &Path, slot_count: u32) -> Result<Self, StoreError> {
        assert!(slot_count > 0, "revision table needs at least one slot");
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < Self::HEADER_LEN {
            return Err(FatalError::Malformed("revision table header").into());
        }

        let actual_magic: [u8; 4] =
            mmap[OFF_MAGIC..OFF_MAGIC + 4].try_into().expect("4-byte slice");
        if actual_magic != Self::MAGIC {
            return Err(FatalError::BadMagic { expected: Self::MAGIC, actual: actual_magic }.into());
        }
        let major = u16::from_le_bytes([mmap[OFF_MAJOR], mmap[OFF_MAJOR + 1]]);
        let minor = u16::from_le_bytes([mmap[OFF_MINOR], mmap[OFF_MINOR + 1]]);
        if major != Self::MAJOR || minor > Self::MINOR {
            return Err(FatalError::VersionMismatch { major, minor }.into());
        }
        let on_disk = u32::from_le_bytes(
            mmap[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4].try_into().expect("4-byte slice"),
        );
        if on_disk == 0 || mmap.len() < Self::file_len(on_disk) as usize {
            return Err(FatalError::Malformed("revision table length").into());
        }
        if slot_count < on_disk {
            return Err(FatalError::PoolShrink { configured: slot_count, on_disk }.into());
        }
        if slot_count > on_disk {
            info!("expanding revision table from {on_disk} to {slot_count} slots");
            drop(mmap);
            file.set_len(Self::file_len(slot_count))?;
            mmap = unsafe { MmapMut::map_mut(&file)? };
            mmap[Self::file_len(on_disk) as usize..].fill(SENTINEL);
            Self::write_header(&mut mmap, slot_count);
            mmap.flush()?;
        }

        // The newest live record tells us where issuance left off. Its
        // positions were taken under a possibly smaller modulus, so the ring
        // restarts empty: old records stay readable until overwritten.
        let latest = Self::scan_latest(&mmap, slot_count)?;
        let leading = latest.as_ref().map(|record| record.leading()).unwrap_or(0);
        let snapshot = CounterSnapshot::new(slot_count - 1, leading, leading);
        let buffer = BlockBuffer::restore(mmap, Self::HEADER_LEN, Self::SLOT_SIZE, snapshot)?;
        debug!(
            "opened revision table at {} ({} slots, latest {:?})",
            path.display(),
            slot_count,
            latest.as_ref().map(RevisionRecord::revision)
        );
        Ok(Self { buffer, slot_count, latest })
    }

    fn parse_slot(bytes: &[u8]) -> Result<Option<RevisionRecord>, FatalError> {
        if bytes.iter().all(|&b| b == SENTINEL) || bytes.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let record = RevisionRecord::read_from_bytes(bytes)
            .map_err(|_| FatalError::Malformed("revision record"))?;
        if record.revision.get() == 0 {
            return Err(FatalError::Malformed("revision record"));
        }
        Ok(Some(record))
    }

    fn scan_latest(mmap: &MmapMut, slot_count: u32) -> Result<Option<RevisionRecord>, FatalError> {
        let mut latest: Option<RevisionRecord> = None;
        for index in 0..slot_count as usize {
            let start = Self::HEADER_LEN + index * Self::SLOT_SIZE;
            let slot = &mmap[start..start + Self::SLOT_SIZE];
            if let Some(record) = Self::parse_slot(slot)? {
                if latest.as_ref().map(|best| record.revision() > best.revision()).unwrap_or(true) {
                    latest = Some(record);
                }
            }
        }
        Ok(latest)
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// The record of the highest revision ever recorded, if any.
    pub fn latest(&self) -> Option<&RevisionRecord> {
        self.latest.as_ref()
    }

    /// The highest published revision among live records, if any.
    pub fn latest_published(&self) -> Result<Option<RevisionRecord>, StoreError> {
        let mut best: Option<RevisionRecord> = None;
        for index in 0..self.slot_count {
            if let Some(record) = Self::parse_slot(self.buffer.block(index)?)? {
                if record.is_published()
                    && best.as_ref().map(|b| record.revision() > b.revision()).unwrap_or(true)
                {
                    best = Some(record);
                }
            }
        }
        Ok(best)
    }

    /// Acquires the next ring slot, evicting the oldest retained record when
    /// the ring is full. Returns the slot index and the new free-running
    /// leading count of the issuing counter.
    pub fn issue_slot(&mut self) -> Result<(u32, u32), StoreError> {
        if self.buffer.counter().snapshot().is_full() {
            self.buffer.release()?;
        }
        Ok(self.buffer.acquire_raw()?)
    }

    /// Persists `record` into a slot obtained from
    /// [`issue_slot`](Self::issue_slot) and flushes it to disk.
    pub fn write(&mut self, slot: u32, record: RevisionRecord) -> Result<(), StoreError> {
        *self.buffer.view_mut::<RevisionRecord>(slot)? = record;
        self.buffer.flush()?;
        if self.latest.as_ref().map(|best| record.revision() > best.revision()).unwrap_or(true) {
            self.latest = Some(record);
        }
        Ok(())
    }

    /// Sets the published flag on the record in `slot`, which must still hold
    /// `revision`.
    pub fn mark_published(&mut self, slot: u32, revision: Revision) -> Result<(), StoreError> {
        let record = self.buffer.view_mut::<RevisionRecord>(slot)?;
        if record.revision() != revision {
            return Err(StoreError::IllegalState("revision slot was evicted before publish"));
        }
        record.publish();
        let updated = *record;
        self.buffer.flush()?;
        if self.latest.as_ref().map(|best| best.revision() == revision).unwrap_or(false) {
            self.latest = Some(updated);
        }
        Ok(())
    }

    /// Finds the ring slot currently holding `revision`, if it has not been
    /// evicted.
    pub fn find_slot(&self, revision: Revision) -> Result<Option<u32>, StoreError> {
        for index in 0..self.slot_count {
            if let Some(record) = Self::parse_slot(self.buffer.block(index)?)? {
                if record.revision() == revision {
                    return Ok(Some(index));
                }
            }
        }
        Ok(None)
    }

    /// The issuing counter's current state.
    pub fn counter_snapshot(&self) -> CounterSnapshot {
        self.buffer.counter().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot_after(table: &RevisionTable, leading: u32) -> CounterSnapshot {
        CounterSnapshot::new(table.slot_count() - 1, leading, table.counter_snapshot().trailing())
    }

    fn issue(table: &mut RevisionTable, revision: u64) -> u32 {
        let (slot, leading) = table.issue_slot().unwrap();
        let record = RevisionRecord::new(Revision::new(revision), snapshot_after(table, leading));
        table.write(slot, record).unwrap();
        slot
    }

    #[test]
    fn test_create_then_reopen_restores_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");

        {
            let mut table = RevisionTable::create(&path, 4).unwrap();
            assert!(table.latest().is_none());
            for revision in 1..=3 {
                let slot = issue(&mut table, revision);
                table.mark_published(slot, Revision::new(revision)).unwrap();
            }
        }

        let table = RevisionTable::open(&path, 4).unwrap();
        let latest = table.latest().unwrap();
        assert_eq!(latest.revision(), Revision::new(3));
        assert_eq!(latest.leading(), 3);
        assert!(latest.is_published());
        assert_eq!(table.latest_published().unwrap().unwrap().revision(), Revision::new(3));
    }

    #[test]
    fn test_unpublished_record_survives_reopen_as_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");

        {
            let mut table = RevisionTable::create(&path, 4).unwrap();
            let slot = issue(&mut table, 1);
            table.mark_published(slot, Revision::new(1)).unwrap();
            issue(&mut table, 2); // crash before publish
        }

        let table = RevisionTable::open(&path, 4).unwrap();
        assert_eq!(table.latest().unwrap().revision(), Revision::new(2));
        assert!(!table.latest().unwrap().is_published());
        assert_eq!(table.latest_published().unwrap().unwrap().revision(), Revision::new(1));
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");

        let mut table = RevisionTable::create(&path, 2).unwrap();
        for revision in 1..=5 {
            issue(&mut table, revision);
        }
        // Only the two newest survive; publishing an evicted revision fails.
        assert_eq!(table.latest().unwrap().revision(), Revision::new(5));
        assert!(matches!(
            table.mark_published(0, Revision::new(1)),
            Err(StoreError::IllegalState(_))
        ));
    }

    #[test]
    fn test_expand_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");

        {
            let mut table = RevisionTable::create(&path, 2).unwrap();
            issue(&mut table, 1);
        }

        let table = RevisionTable::open(&path, 8).unwrap();
        assert_eq!(table.slot_count(), 8);
        assert_eq!(table.latest().unwrap().revision(), Revision::new(1));

        drop(table);
        let table = RevisionTable::open(&path, 8).unwrap();
        assert_eq!(table.slot_count(), 8);
    }

    #[test]
    fn test_shrink_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");
        RevisionTable::create(&path, 8).unwrap();

        match RevisionTable::open(&path, 2) {
            Err(StoreError::Fatal(FatalError::PoolShrink { configured: 2, on_disk: 8 })) => {}
            other => panic!("expected pool shrink error, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_header_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revisions.tbl");
        RevisionTable::create(&path, 2).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'X';
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            RevisionTable::open(&path, 2),
            Err(StoreError::Fatal(FatalError::BadMagic { .. }))
        ));
    }
}
