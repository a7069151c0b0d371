use std::{
    cmp::Ordering,
    error, fmt,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};
use zerocopy::{ByteEq, FromBytes, Immutable, IntoBytes, KnownLayout};

/// A wraparound leading/trailing index pair packed into one atomically
/// updated 64-bit word; the primitive underneath every bounded slot pool
/// (journal slots, revision-table slots).
///
/// The word stores two free-running 32-bit counts (leading in the high half,
/// trailing in the low half); slot *indices* are the counts modulo `max + 1`
/// and therefore lie in `[0, max]`. The pool is empty iff the counts are
/// equal and full iff `leading - trailing == max + 1`, so all `max + 1`
/// slots are usable.
///
/// Both operations are lock-free compare-and-swap loops: correctness under
/// concurrent producers and consumers must not depend on blocking.
#[derive(Debug)]
pub struct DualCounter {
    word: AtomicU64,
    max: u32,
}

/// Errors arising from counter operations. Both are fatal: `Exhausted` means
/// the pool is undersized for the workload, `NothingAcquired` is a misuse of
/// the release protocol.
#[derive(Debug, PartialEq, Eq)]
pub enum CounterError {
    Exhausted,
    NothingAcquired,
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "slot pool exhausted"),
            Self::NothingAcquired => write!(f, "release with no slot acquired"),
        }
    }
}

impl error::Error for CounterError {}

#[inline]
const fn pack(leading: u32, trailing: u32) -> u64 {
    ((leading as u64) << 32) | trailing as u64
}

#[inline]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl DualCounter {
    /// Creates a counter governing a pool of `max + 1` slots.
    pub fn new(max: u32) -> Self {
        Self { word: AtomicU64::new(0), max }
    }

    /// Reconstructs a counter from a persisted snapshot.
    pub fn restore(snapshot: CounterSnapshot) -> Self {
        Self { word: AtomicU64::new(pack(snapshot.leading, snapshot.trailing)), max: snapshot.max }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    #[inline]
    fn modulus(&self) -> u64 {
        self.max as u64 + 1
    }

    /// Atomically advances the leading count and returns the index of the
    /// acquired slot, or `Exhausted` if the pool is full.
    pub fn acquire(&self) -> Result<u32, CounterError> {
        self.acquire_raw().map(|(index, _)| index)
    }

    /// Like [`acquire`](Self::acquire), but also returns the new free-running
    /// leading count, which callers may use as a monotonic sequence number.
    pub fn acquire_raw(&self) -> Result<(u32, u32), CounterError> {
        let mut word = self.word.load(AtomicOrdering::Relaxed);
        loop {
            let (leading, trailing) = unpack(word);
            if leading.wrapping_sub(trailing) as u64 >= self.modulus() {
                return Err(CounterError::Exhausted);
            }
            let new_leading = leading.wrapping_add(1);
            match self.word.compare_exchange_weak(
                word,
                pack(new_leading, trailing),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return Ok(((leading as u64 % self.modulus()) as u32, new_leading)),
                Err(value) => word = value,
            }
        }
    }

    /// Atomically advances the trailing count and returns the index of the
    /// released slot, or `NothingAcquired` if the pool is empty.
    pub fn release(&self) -> Result<u32, CounterError> {
        let mut word = self.word.load(AtomicOrdering::Relaxed);
        loop {
            let (leading, trailing) = unpack(word);
            if leading == trailing {
                return Err(CounterError::NothingAcquired);
            }
            let new_trailing = trailing.wrapping_add(1);
            match self.word.compare_exchange_weak(
                word,
                pack(leading, new_trailing),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return Ok((trailing as u64 % self.modulus()) as u32),
                Err(value) => word = value,
            }
        }
    }

    /// An immutable, comparable snapshot of the counter's state, usable to
    /// persist and restore the counter across restarts.
    pub fn snapshot(&self) -> CounterSnapshot {
        let (leading, trailing) = unpack(self.word.load(AtomicOrdering::Acquire));
        CounterSnapshot { max: self.max, leading, trailing }
    }
}

/// `{max, leading, trailing}` captured from a [`DualCounter`].
///
/// `leading` and `trailing` are the free-running counts, not the wrapped
/// indices; use [`leading_index`]/[`trailing_index`] for the latter.
///
/// Snapshots with equal `max` are ordered by the wrapping signed distance of
/// their leading counts. This is valid only while the two snapshots are less
/// than 2^31 acquisitions apart, i.e. while neither has been overtaken by
/// wraparound relative to the other; snapshots of pools with different `max`
/// are not comparable at all.
///
/// [`leading_index`]: CounterSnapshot::leading_index
/// [`trailing_index`]: CounterSnapshot::trailing_index
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, ByteEq, Copy, Clone, Debug)]
pub struct CounterSnapshot {
    max: u32,
    leading: u32,
    trailing: u32,
}

impl CounterSnapshot {
    pub fn new(max: u32, leading: u32, trailing: u32) -> Self {
        Self { max, leading, trailing }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn leading(&self) -> u32 {
        self.leading
    }

    pub fn trailing(&self) -> u32 {
        self.trailing
    }

    #[inline]
    fn modulus(&self) -> u64 {
        self.max as u64 + 1
    }

    /// Index of the most recently acquired slot's successor, in `[0, max]`.
    pub fn leading_index(&self) -> u32 {
        (self.leading as u64 % self.modulus()) as u32
    }

    /// Index of the oldest acquired slot, in `[0, max]`.
    pub fn trailing_index(&self) -> u32 {
        (self.trailing as u64 % self.modulus()) as u32
    }

    /// Number of slots currently acquired.
    pub fn in_use(&self) -> u32 {
        self.leading.wrapping_sub(self.trailing)
    }

    pub fn is_empty(&self) -> bool {
        self.leading == self.trailing
    }

    pub fn is_full(&self) -> bool {
        self.in_use() as u64 == self.modulus()
    }
}

impl PartialOrd for CounterSnapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.max != other.max {
            return None;
        }
        match (self.leading.wrapping_sub(other.leading) as i32).cmp(&0) {
            Ordering::Equal => Some((self.trailing.wrapping_sub(other.trailing) as i32).cmp(&0)),
            ordering => Some(ordering),
        }
    }
}
