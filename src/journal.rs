use crate::{
    block::{BlockBuffer, FILLER},
    error::{FatalError, StoreError},
    program::Program,
};
use fxhash::FxHashSet;
use log::{debug, info, warn};
use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

const OFF_MAGIC: usize = 0;
const OFF_MAJOR: usize = 4;
const OFF_MINOR: usize = 6;
const OFF_SLOT_SIZE: usize = 8;
const OFF_SLOT_COUNT: usize = 12;

/// Write-ahead journal of transaction programs.
///
/// One memory-mapped file: a 16-byte header followed by fixed-size slots
/// managed as a circular block pool. Every read-write transaction owns one
/// slot from begin to close; its committed program is written (and flushed)
/// into the slot before any effect is applied, so a crash leaves either a
/// filler slot (nothing durable happened) or a complete checksummed program
/// that recovery can replay.
///
/// Slots are reclaimed in FIFO order by the underlying counter, but
/// transactions close in any order; closes of non-trailing slots are parked
/// and reconciled once the trailing slot itself closes.
#[derive(Debug)]
pub struct Journal {
    buffer: BlockBuffer,
    pending_release: FxHashSet<u32>,
}

/// A journal file that has been scanned for surviving programs but not yet
/// reset. The caller replays [`programs`](Self::programs) first; only
/// [`into_journal`](Self::into_journal) erases the slots, so an interrupted
/// recovery starts over from the same state.
#[derive(Debug)]
pub struct JournalRecovery {
    file: File,
    programs: Vec<Program>,
}

impl Journal {
    pub const MAGIC: [u8; 4] = *b"RVJL";
    pub const MAJOR: u16 = 1;
    pub const MINOR: u16 = 0;
    pub const HEADER_LEN: usize = 16;

    fn file_len(slot_size: u32, slot_count: u32) -> u64 {
        Self::HEADER_LEN as u64 + slot_size as u64 * slot_count as u64
    }

    fn init(file: File, slot_size: u32, slot_count: u32) -> Result<Self, StoreError> {
        assert!(slot_count > 0, "journal needs at least one slot");
        assert!(
            slot_size as usize >= Program::HEADER_LEN && slot_size % 8 == 0,
            "journal slot size must be 8-byte aligned and hold at least a program header"
        );
        file.set_len(Self::file_len(slot_size, slot_count))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&Self::MAGIC);
        mmap[OFF_MAJOR..OFF_MAJOR + 2].copy_from_slice(&Self::MAJOR.to_le_bytes());
        mmap[OFF_MINOR..OFF_MINOR + 2].copy_from_slice(&Self::MINOR.to_le_bytes());
        mmap[OFF_SLOT_SIZE..OFF_SLOT_SIZE + 4].copy_from_slice(&slot_size.to_le_bytes());
        mmap[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4].copy_from_slice(&slot_count.to_le_bytes());
        mmap[Self::HEADER_LEN..].fill(FILLER);
        mmap.flush()?;

        let buffer = BlockBuffer::new(mmap, Self::HEADER_LEN, slot_size as usize, slot_count)?;
        Ok(Self { buffer, pending_release: FxHashSet::default() })
    }

    /// Creates a fresh journal file with every slot free.
    pub fn create(path: &Path, slot_size: u32, slot_count: u32) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        debug!(
            "created journal at {} ({slot_count} slots of {slot_size} bytes)",
            path.display()
        );
        Self::init(file, slot_size, slot_count)
    }

    /// Opens an existing journal and scans its slots. Filler slots are free;
    /// a slot starting with the program magic must load as a valid committed
    /// program (anything else is corruption, as is any other content). The
    /// surviving programs are returned for replay, ordered by revision.
    pub fn open(path: &Path) -> Result<JournalRecovery, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < Self::HEADER_LEN {
            return Err(FatalError::Malformed("journal header").into());
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
        let slot_size = u32::from_le_bytes(
            mmap[OFF_SLOT_SIZE..OFF_SLOT_SIZE + 4].try_into().expect("4-byte slice"),
        ) as usize;
        let slot_count = u32::from_le_bytes(
            mmap[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4].try_into().expect("4-byte slice"),
        );
        if slot_size == 0
            || slot_count == 0
            || mmap.len() < Self::file_len(slot_size as u32, slot_count) as usize
        {
            return Err(FatalError::Malformed("journal length").into());
        }

        let mut programs = Vec::new();
        for index in 0..slot_count as usize {
            let start = Self::HEADER_LEN + index * slot_size;
            let slot = &mmap[start..start + slot_size];
            if slot.iter().all(|&b| b == FILLER) {
                continue;
            }
            if slot[..4] != Program::MAGIC {
                return Err(FatalError::Malformed("journal slot").into());
            }
            let program = Program::load(slot)?;
            warn!(
                "journal slot {index} holds a surviving program for {} ({:?} phases)",
                program.revision(),
                program.phases()
            );
            programs.push(program);
        }
        programs.sort_by_key(Program::revision);
        if !programs.is_empty() {
            info!("journal recovery found {} surviving programs", programs.len());
        }
        Ok(JournalRecovery { file, programs })
    }

    /// Takes a slot for a beginning read-write transaction.
    pub fn acquire(&mut self) -> Result<u32, StoreError> {
        Ok(self.buffer.acquire()?)
    }

    /// Writes a committed program into the transaction's slot and flushes it
    /// to disk. Nothing may be applied before this returns.
    pub fn write(&mut self, slot: u32, program: &Program) -> Result<(), StoreError> {
        if !program.is_committed() {
            return Err(StoreError::IllegalState("journaling an uncommitted program"));
        }
        let block = self.buffer.block_mut(slot)?;
        if program.len() > block.len() {
            return Err(FatalError::ProgramTooLarge {
                len: program.len(),
                slot_size: block.len(),
            }
            .into());
        }
        block[..program.len()].copy_from_slice(program.as_bytes());
        self.buffer.flush()?;
        Ok(())
    }

    /// Gives a transaction's slot back. The physical reclaim is FIFO, so a
    /// non-trailing slot is parked until every older slot is also done.
    pub fn release(&mut self, slot: u32) -> Result<(), StoreError> {
        self.pending_release.insert(slot);
        let mut reclaimed = false;
        loop {
            let snapshot = self.buffer.counter().snapshot();
            if snapshot.is_empty() || !self.pending_release.remove(&snapshot.trailing_index()) {
                break;
            }
            self.buffer.release()?;
            reclaimed = true;
        }
        if reclaimed {
            self.buffer.flush()?;
        }
        Ok(())
    }

    pub fn slot_count(&self) -> u32 {
        self.buffer.block_count()
    }

    pub fn slot_size(&self) -> usize {
        self.buffer.block_size()
    }
}

impl JournalRecovery {
    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    /// Erases every slot and re-dimensions the journal to the configured
    /// geometry. Only call after the surviving programs have been replayed;
    /// after recovery the journal is empty, so resizing is always safe here.
    pub fn into_journal(self, slot_size: u32, slot_count: u32) -> Result<Journal, StoreError> {
        Journal::init(self.file, slot_size, slot_count)
    }
}
