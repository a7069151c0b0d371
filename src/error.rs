use crate::{
    block::BlockError, counter::CounterError, lock::LockKey, path::ResourcePath,
    resource::ResourceId,
};
use std::{error, fmt, io};

/// Top-level error taxonomy of the store.
///
/// `Conflict` is retryable (the caller should retry the whole transaction).
/// `PathNotFound`/`ResourceNotFound` and the `Duplicate*` variants are caller
/// errors, recoverable at the call site. `Fatal` indicates on-disk corruption
/// or a broken invariant and must propagate to the top-level caller; it is
/// never caught internally.
#[derive(Debug)]
pub enum StoreError {
    /// Optimistic lock acquisition failed: another in-flight transaction
    /// holds the same path or resource id.
    Conflict(LockKey),
    /// The path does not resolve to a resource at the requested revision.
    PathNotFound(ResourcePath),
    /// The resource id does not exist at the requested revision.
    ResourceNotFound(ResourceId),
    /// The destination path is already linked at the requested revision.
    DuplicatePath(ResourcePath),
    /// The resource id already exists at the requested revision.
    DuplicateResource(ResourceId),
    /// A wildcard path was passed to a mutating operation.
    WildcardRejected(ResourcePath),
    /// Non-retryable corruption or invariant violation.
    Fatal(FatalError),
    /// The transaction has already been committed, rolled back or closed, or
    /// an API contract was otherwise violated.
    IllegalState(&'static str),
    /// An I/O failure not recognized as one of the above.
    IO(io::Error),
}

impl StoreError {
    /// Whether the caller may recover by retrying the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(key) => write!(f, "transaction conflict on {key}"),
            Self::PathNotFound(path) => write!(f, "path not found: {path}"),
            Self::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            Self::DuplicatePath(path) => write!(f, "path already linked: {path}"),
            Self::DuplicateResource(id) => write!(f, "resource already exists: {id}"),
            Self::WildcardRejected(path) => {
                write!(f, "wildcard path rejected by mutating operation: {path}")
            }
            Self::Fatal(e) => write!(f, "fatal: {e}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Self::IO(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl error::Error for StoreError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::IO(e) => Some(e),
            Self::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::IO(e)
    }
}

impl From<FatalError> for StoreError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

impl From<CounterError> for StoreError {
    fn from(e: CounterError) -> Self {
        Self::Fatal(e.into())
    }
}

impl From<BlockError> for StoreError {
    fn from(e: BlockError) -> Self {
        Self::Fatal(e.into())
    }
}

/// Conditions that indicate disk corruption or a programming invariant
/// violation. The process should not silently continue operating on the
/// affected store.
#[derive(Debug)]
pub enum FatalError {
    /// A checksum over a committed program's byte range did not match.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A magic tag of an on-disk artifact did not match.
    BadMagic { expected: [u8; 4], actual: [u8; 4] },
    /// The major/minor version of an on-disk artifact is not supported.
    VersionMismatch { major: u16, minor: u16 },
    /// A bounded slot pool ran out of slots.
    Exhausted(&'static str),
    /// A slot pool release was attempted with nothing acquired.
    UnbalancedRelease(&'static str),
    /// The configured pool is smaller than the one recorded on disk.
    PoolShrink { configured: u32, on_disk: u32 },
    /// A program command carried an opcode outside the instruction set.
    UnknownOpcode(u8),
    /// A program or on-disk record could not be decoded.
    Malformed(&'static str),
    /// A compiled program does not fit into a journal slot.
    ProgramTooLarge { len: usize, slot_size: usize },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
            Self::BadMagic { expected, actual } => {
                write!(f, "bad magic: expected {expected:?}, got {actual:?}")
            }
            Self::VersionMismatch { major, minor } => {
                write!(f, "unsupported on-disk version {major}.{minor}")
            }
            Self::Exhausted(what) => write!(f, "{what} pool exhausted"),
            Self::UnbalancedRelease(what) => write!(f, "{what} release with nothing acquired"),
            Self::PoolShrink { configured, on_disk } => {
                write!(f, "pool shrink not supported: configured {configured}, on disk {on_disk}")
            }
            Self::UnknownOpcode(op) => write!(f, "unknown program opcode {op:#04x}"),
            Self::Malformed(what) => write!(f, "malformed {what}"),
            Self::ProgramTooLarge { len, slot_size } => {
                write!(f, "program of {len} bytes exceeds journal slot size {slot_size}")
            }
        }
    }
}

impl error::Error for FatalError {}

impl From<CounterError> for FatalError {
    fn from(e: CounterError) -> Self {
        match e {
            CounterError::Exhausted => Self::Exhausted("slot"),
            CounterError::NothingAcquired => Self::UnbalancedRelease("slot"),
        }
    }
}

impl From<BlockError> for FatalError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::Misaligned => Self::Malformed("block region alignment"),
            BlockError::RegionTooSmall { .. } => Self::Malformed("block region size"),
            BlockError::BadIndex(_) => Self::Malformed("block index"),
            BlockError::Cast => Self::Malformed("block record layout"),
        }
    }
}
