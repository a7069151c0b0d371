use crate::counter::{CounterError, CounterSnapshot, DualCounter};
use memmap2::MmapMut;
use std::{error, fmt, io};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Pattern written over a block when its slot is released.
pub const FILLER: u8 = 0x00;

/// Slices one large memory-mapped buffer into fixed-size blocks and hands
/// them out/reclaims them under a single [`DualCounter`].
///
/// This is the allocation-free backbone shared by the transaction journal
/// (pool of program slots) and the revision table (pool of revision-snapshot
/// slots). Block 0 starts at `base`, leaving room for a file header in front.
#[derive(Debug)]
pub struct BlockBuffer {
    mmap: MmapMut,
    base: usize,
    block_size: usize,
    counter: DualCounter,
}

#[derive(Debug)]
pub enum BlockError {
    /// `base` and the block size must be multiples of 8 so that typed views
    /// stay aligned.
    Misaligned,
    /// The mapped region cannot hold the requested blocks.
    RegionTooSmall { needed: usize, available: usize },
    /// No such block.
    BadIndex(u32),
    /// The requested record type does not fit in a block.
    Cast,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned => write!(f, "block region is not 8-byte aligned"),
            Self::RegionTooSmall { needed, available } => {
                write!(f, "block region too small: need {needed} bytes, have {available}")
            }
            Self::BadIndex(index) => write!(f, "no block with index {index}"),
            Self::Cast => write!(f, "record type does not fit in a block"),
        }
    }
}

impl error::Error for BlockError {}

impl BlockBuffer {
    /// Wraps `mmap` with a fresh counter (all slots free).
    pub fn new(
        mmap: MmapMut,
        base: usize,
        block_size: usize,
        block_count: u32,
    ) -> Result<Self, BlockError> {
        assert!(block_count > 0, "block pool must have at least one slot");
        Self::with_counter(mmap, base, block_size, DualCounter::new(block_count - 1))
    }

    /// Wraps `mmap` restoring the slot pool position from a persisted
    /// snapshot.
    pub fn restore(
        mmap: MmapMut,
        base: usize,
        block_size: usize,
        snapshot: CounterSnapshot,
    ) -> Result<Self, BlockError> {
        Self::with_counter(mmap, base, block_size, DualCounter::restore(snapshot))
    }

    fn with_counter(
        mmap: MmapMut,
        base: usize,
        block_size: usize,
        counter: DualCounter,
    ) -> Result<Self, BlockError> {
        if base % 8 != 0 || block_size == 0 || block_size % 8 != 0 {
            return Err(BlockError::Misaligned);
        }
        let needed = base + block_size * (counter.max() as usize + 1);
        if needed > mmap.len() {
            return Err(BlockError::RegionTooSmall { needed, available: mmap.len() });
        }
        Ok(Self { mmap, base, block_size, counter })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.counter.max() + 1
    }

    pub fn counter(&self) -> &DualCounter {
        &self.counter
    }

    #[inline]
    fn offset(&self, index: u32) -> Result<usize, BlockError> {
        if index > self.counter.max() {
            return Err(BlockError::BadIndex(index));
        }
        Ok(self.base + index as usize * self.block_size)
    }

    /// Acquires the next block for exclusive use by the caller; the slot
    /// stays owned until [`release`](Self::release) reclaims it (FIFO).
    pub fn acquire(&self) -> Result<u32, CounterError> {
        self.counter.acquire()
    }

    /// Like [`acquire`](Self::acquire), but also returns the free-running
    /// leading count.
    pub fn acquire_raw(&self) -> Result<(u32, u32), CounterError> {
        self.counter.acquire_raw()
    }

    /// Reclaims the oldest acquired block: clears it to [`FILLER`] and
    /// advances the trailing index, making the slot eligible for reuse.
    /// Returns the reclaimed index.
    pub fn release(&mut self) -> Result<u32, CounterError> {
        let snapshot = self.counter.snapshot();
        if snapshot.is_empty() {
            return Err(CounterError::NothingAcquired);
        }
        let index = snapshot.trailing_index();
        let offset = self.offset(index).expect("trailing index is always in range");
        self.mmap[offset..offset + self.block_size].fill(FILLER);
        self.counter.release()
    }

    /// Inspects the block the next [`acquire`](Self::acquire) would hand out,
    /// without acquiring it. Returns `None` when the pool is full (the slot
    /// is still owned).
    pub fn peek(&self) -> Option<&[u8]> {
        let snapshot = self.counter.snapshot();
        if snapshot.is_full() {
            return None;
        }
        let offset = self.offset(snapshot.leading_index()).expect("leading index is in range");
        Some(&self.mmap[offset..offset + self.block_size])
    }

    pub fn block(&self, index: u32) -> Result<&[u8], BlockError> {
        let offset = self.offset(index)?;
        Ok(&self.mmap[offset..offset + self.block_size])
    }

    pub fn block_mut(&mut self, index: u32) -> Result<&mut [u8], BlockError> {
        let offset = self.offset(index)?;
        Ok(&mut self.mmap[offset..offset + self.block_size])
    }

    /// Reads the block back as a typed fixed-layout record without copying.
    pub fn view<T>(&self, index: u32) -> Result<&T, BlockError>
    where
        T: FromBytes + KnownLayout + Immutable,
    {
        let block = self.block(index)?;
        T::ref_from_prefix(block).map(|(record, _)| record).map_err(|_| BlockError::Cast)
    }

    /// Mutable typed view over a block.
    pub fn view_mut<T>(&mut self, index: u32) -> Result<&mut T, BlockError>
    where
        T: FromBytes + IntoBytes + KnownLayout + Immutable,
    {
        let block = self.block_mut(index)?;
        T::mut_from_prefix(block).map(|(record, _)| record).map_err(|_| BlockError::Cast)
    }

    /// Flushes the mapped region to the backing file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}
