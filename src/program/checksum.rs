use crate::error::FatalError;
use std::fmt;

/// Checksum algorithm protecting a compiled program's byte range.
///
/// The algorithm is chosen once at program-commit time and recorded in the
/// program header, so programs with different algorithms coexist in the same
/// journal.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    Crc32,
    Adler32,
}

impl ChecksumAlgorithm {
    pub const fn code(&self) -> u8 {
        match self {
            Self::Crc32 => 1,
            Self::Adler32 => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FatalError> {
        match code {
            1 => Ok(Self::Crc32),
            2 => Ok(Self::Adler32),
            _ => Err(FatalError::Malformed("checksum algorithm code")),
        }
    }

    pub fn compute(&self, bytes: &[u8]) -> u32 {
        match self {
            Self::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(bytes);
                hasher.finalize()
            }
            Self::Adler32 => {
                let mut hasher = adler32::RollingAdler32::new();
                hasher.update_buffer(bytes);
                hasher.hash()
            }
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc-32"),
            Self::Adler32 => write!(f, "adler-32"),
        }
    }
}
