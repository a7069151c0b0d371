use crate::{
    error::FatalError,
    program::{ChecksumAlgorithm, Command, Phase, PhaseMask},
    revision::Revision,
};

const OFF_MAGIC: usize = 0;
const OFF_MAJOR: usize = 4;
const OFF_MINOR: usize = 6;
const OFF_ALGORITHM: usize = 8;
const OFF_PHASES: usize = 9;
const OFF_COMMIT_COUNT: usize = 10;
const OFF_CLEANUP_COUNT: usize = 12;
const OFF_TOTAL_LEN: usize = 16;
const OFF_CHECKSUM: usize = 20;
const OFF_REVISION: usize = 24;

#[inline]
fn get_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4-byte slice"))
}

/// A compiled transaction program: an immutable, checksummed, two-segment
/// instruction sequence (Commit segment, then Cleanup segment).
///
/// A program is *uncommitted* right after [`compile`], *committed* once
/// [`commit`] has set the phase bitmask and checksum, and only then eligible
/// for interpretation. The durable bytes are the single source of truth: the
/// same program is replayed identically during normal commit and during crash
/// recovery.
///
/// Byte layout (little-endian):
///
/// | offset | field |
/// |---|---|
/// | 0 | magic `"RVPG"` |
/// | 4 | major version (u16) |
/// | 6 | minor version (u16) |
/// | 8 | checksum algorithm code (u8, 0 while uncommitted) |
/// | 9 | phase bitmask (u8, 0 while uncommitted) |
/// | 10 | commit-segment command count (u16) |
/// | 12 | cleanup-segment command count (u16) |
/// | 14 | reserved (u16) |
/// | 16 | total length (u32) |
/// | 20 | checksum (u32, over the full range with this field zeroed) |
/// | 24 | committing revision (u64) |
/// | 32 | commands |
///
/// [`compile`]: crate::program::ProgramBuilder::compile
/// [`commit`]: Program::commit
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Program {
    bytes: Vec<u8>,
}

impl Program {
    pub const MAGIC: [u8; 4] = *b"RVPG";
    pub const MAJOR: u16 = 1;
    pub const MINOR: u16 = 0;
    pub const HEADER_LEN: usize = 32;

    /// Assembles an uncommitted program from pre-serialized segments.
    /// Callers go through [`ProgramBuilder`](crate::program::ProgramBuilder).
    pub(super) fn from_segments(
        commit_count: u16,
        cleanup_count: u16,
        body: &[u8],
    ) -> Self {
        let total_len = Self::HEADER_LEN + body.len();
        let mut bytes = vec![0u8; total_len];
        bytes[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&Self::MAGIC);
        bytes[OFF_MAJOR..OFF_MAJOR + 2].copy_from_slice(&Self::MAJOR.to_le_bytes());
        bytes[OFF_MINOR..OFF_MINOR + 2].copy_from_slice(&Self::MINOR.to_le_bytes());
        bytes[OFF_COMMIT_COUNT..OFF_COMMIT_COUNT + 2]
            .copy_from_slice(&commit_count.to_le_bytes());
        bytes[OFF_CLEANUP_COUNT..OFF_CLEANUP_COUNT + 2]
            .copy_from_slice(&cleanup_count.to_le_bytes());
        bytes[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 4]
            .copy_from_slice(&(total_len as u32).to_le_bytes());
        bytes[Self::HEADER_LEN..].copy_from_slice(body);
        Self { bytes }
    }

    /// Marks the program valid for the given phases at the given revision:
    /// records the phase bitmask and algorithm, then computes the checksum
    /// over the full byte range. The program is immutable afterwards.
    pub fn commit(&mut self, phases: PhaseMask, algorithm: ChecksumAlgorithm, revision: Revision) {
        assert!(!phases.is_empty(), "a committed program needs at least one phase");
        self.bytes[OFF_ALGORITHM] = algorithm.code();
        self.bytes[OFF_PHASES] = phases.bits();
        self.bytes[OFF_REVISION..OFF_REVISION + 8]
            .copy_from_slice(&revision.as_u64().to_le_bytes());
        self.bytes[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
        let checksum = algorithm.compute(&self.bytes);
        self.bytes[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Validates magic, version and checksum, then exposes the program.
    /// Any mismatch is fatal corruption. Trailing bytes beyond the recorded
    /// total length (journal slot padding) are ignored.
    pub fn load(bytes: &[u8]) -> Result<Self, FatalError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(FatalError::Malformed("program header"));
        }
        let actual_magic: [u8; 4] = bytes[OFF_MAGIC..OFF_MAGIC + 4].try_into().expect("4 bytes");
        if actual_magic != Self::MAGIC {
            return Err(FatalError::BadMagic { expected: Self::MAGIC, actual: actual_magic });
        }
        let major = get_u16(bytes, OFF_MAJOR);
        let minor = get_u16(bytes, OFF_MINOR);
        if major != Self::MAJOR || minor > Self::MINOR {
            return Err(FatalError::VersionMismatch { major, minor });
        }
        let total_len = get_u32(bytes, OFF_TOTAL_LEN) as usize;
        if total_len < Self::HEADER_LEN || total_len > bytes.len() {
            return Err(FatalError::Malformed("program length"));
        }

        let algorithm = ChecksumAlgorithm::from_code(bytes[OFF_ALGORITHM])?;
        let expected = get_u32(bytes, OFF_CHECKSUM);
        let mut range = bytes[..total_len].to_vec();
        range[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
        let actual = algorithm.compute(&range);
        if actual != expected {
            return Err(FatalError::ChecksumMismatch { expected, actual });
        }

        range[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&expected.to_le_bytes());
        let program = Self { bytes: range };
        // Decode both segments eagerly so that a malformed body is rejected
        // at load time rather than mid-interpretation.
        program.commands(Phase::Commit)?;
        program.commands(Phase::Cleanup)?;
        Ok(program)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.command_count(Phase::Commit) == 0 && self.command_count(Phase::Cleanup) == 0
    }

    /// Phases this program was committed for; empty while uncommitted.
    pub fn phases(&self) -> PhaseMask {
        PhaseMask::from_bits(self.bytes[OFF_PHASES])
    }

    pub fn is_committed(&self) -> bool {
        !self.phases().is_empty()
    }

    /// The revision this program commits to. Meaningful only once committed.
    pub fn revision(&self) -> Revision {
        Revision::new(u64::from_le_bytes(
            self.bytes[OFF_REVISION..OFF_REVISION + 8].try_into().expect("8-byte slice"),
        ))
    }

    pub fn algorithm(&self) -> Result<ChecksumAlgorithm, FatalError> {
        ChecksumAlgorithm::from_code(self.bytes[OFF_ALGORITHM])
    }

    pub fn command_count(&self, phase: Phase) -> u16 {
        match phase {
            Phase::Commit => get_u16(&self.bytes, OFF_COMMIT_COUNT),
            Phase::Cleanup => get_u16(&self.bytes, OFF_CLEANUP_COUNT),
        }
    }

    /// Decodes the command list of one segment.
    pub fn commands(&self, phase: Phase) -> Result<Vec<Command>, FatalError> {
        let commit_count = self.command_count(Phase::Commit) as usize;
        let cleanup_count = self.command_count(Phase::Cleanup) as usize;

        let mut offset = Self::HEADER_LEN;
        let mut commit = Vec::with_capacity(commit_count);
        for _ in 0..commit_count {
            let (command, consumed) = Command::decode(&self.bytes[offset..])?;
            commit.push(command);
            offset += consumed;
        }
        if phase == Phase::Commit {
            return Ok(commit);
        }

        let mut cleanup = Vec::with_capacity(cleanup_count);
        for _ in 0..cleanup_count {
            let (command, consumed) = Command::decode(&self.bytes[offset..])?;
            cleanup.push(command);
            offset += consumed;
        }
        Ok(cleanup)
    }
}
