use crate::{error::FatalError, path::QualifiedPath, resource::ResourceId};

/// Execution phase a command belongs to.
///
/// Commit-phase commands apply a transaction's durable effects; cleanup-phase
/// commands remove temporary artifacts and are the only ones applied on
/// rollback.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    Commit,
    Cleanup,
}

/// Bitmask of phases a committed program is valid for.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct PhaseMask(u8);

impl PhaseMask {
    pub const NONE: PhaseMask = PhaseMask(0);
    pub const COMMIT: PhaseMask = PhaseMask(0b01);
    pub const CLEANUP: PhaseMask = PhaseMask(0b10);
    pub const ALL: PhaseMask = PhaseMask(0b11);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, phase: Phase) -> bool {
        match phase {
            Phase::Commit => self.0 & Self::COMMIT.0 != 0,
            Phase::Cleanup => self.0 & Self::CLEANUP.0 != 0,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PhaseMask {
    type Output = PhaseMask;

    fn bitor(self, rhs: PhaseMask) -> PhaseMask {
        PhaseMask(self.0 | rhs.0)
    }
}

mod opcode {
    pub const NOOP: u8 = 0;
    pub const UNLINK_FILE: u8 = 1;
    pub const UNLINK_PATH: u8 = 2;
    pub const REMOVE_RESOURCE: u8 = 3;
    pub const LINK_FILE_TO_PATH: u8 = 4;
    pub const LINK_RESOURCE_TO_PATH: u8 = 5;
    pub const LINK_FILE_TO_RESOURCE: u8 = 6;
}

mod tag {
    pub const NULL: u8 = 0;
    pub const FS_PATH: u8 = 1;
    pub const SYM_PATH: u8 = 2;
    pub const RESOURCE_ID: u8 = 3;
}

/// One program instruction with its typed parameters.
///
/// Filesystem paths are stored as UTF-8 strings (the store only ever
/// journals paths it created itself); symbolic paths are stored in their
/// fully-qualified string form.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    Noop,
    UnlinkFile { file: String },
    UnlinkPath { path: QualifiedPath },
    RemoveResource { id: ResourceId },
    LinkFileToPath { file: String, path: QualifiedPath },
    LinkResourceToPath { id: ResourceId, path: QualifiedPath },
    LinkFileToResource { file: String, id: ResourceId },
}

fn put_param(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize, "parameter too long");
    out.push(tag);
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Params<'a> {
    bytes: &'a [u8],
    consumed: usize,
}

impl<'a> Params<'a> {
    fn take(&mut self, expected_tag: u8) -> Result<&'a [u8], FatalError> {
        let rest = &self.bytes[self.consumed..];
        if rest.len() < 3 || rest[0] != expected_tag {
            return Err(FatalError::Malformed("program command parameter"));
        }
        let len = u16::from_le_bytes([rest[1], rest[2]]) as usize;
        if rest.len() < 3 + len {
            return Err(FatalError::Malformed("program command parameter"));
        }
        self.consumed += 3 + len;
        Ok(&rest[3..3 + len])
    }

    fn fs_path(&mut self) -> Result<String, FatalError> {
        let bytes = self.take(tag::FS_PATH)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FatalError::Malformed("filesystem path parameter"))
    }

    fn sym_path(&mut self) -> Result<QualifiedPath, FatalError> {
        let bytes = self.take(tag::SYM_PATH)?;
        let raw = std::str::from_utf8(bytes)
            .map_err(|_| FatalError::Malformed("symbolic path parameter"))?;
        QualifiedPath::parse(raw).map_err(|_| FatalError::Malformed("symbolic path parameter"))
    }

    fn resource_id(&mut self) -> Result<ResourceId, FatalError> {
        let bytes = self.take(tag::RESOURCE_ID)?;
        let bytes: [u8; ResourceId::LEN] =
            bytes.try_into().map_err(|_| FatalError::Malformed("resource id parameter"))?;
        Ok(ResourceId::from_bytes(bytes))
    }
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Noop => opcode::NOOP,
            Self::UnlinkFile { .. } => opcode::UNLINK_FILE,
            Self::UnlinkPath { .. } => opcode::UNLINK_PATH,
            Self::RemoveResource { .. } => opcode::REMOVE_RESOURCE,
            Self::LinkFileToPath { .. } => opcode::LINK_FILE_TO_PATH,
            Self::LinkResourceToPath { .. } => opcode::LINK_RESOURCE_TO_PATH,
            Self::LinkFileToResource { .. } => opcode::LINK_FILE_TO_RESOURCE,
        }
    }

    /// Serializes the command as `opcode · param count · params`, each param
    /// as `tag · length(u16) · bytes`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode());
        match self {
            Self::Noop => out.push(0),
            Self::UnlinkFile { file } => {
                out.push(1);
                put_param(out, tag::FS_PATH, file.as_bytes());
            }
            Self::UnlinkPath { path } => {
                out.push(1);
                put_param(out, tag::SYM_PATH, path.to_string().as_bytes());
            }
            Self::RemoveResource { id } => {
                out.push(1);
                put_param(out, tag::RESOURCE_ID, id.as_bytes());
            }
            Self::LinkFileToPath { file, path } => {
                out.push(2);
                put_param(out, tag::FS_PATH, file.as_bytes());
                put_param(out, tag::SYM_PATH, path.to_string().as_bytes());
            }
            Self::LinkResourceToPath { id, path } => {
                out.push(2);
                put_param(out, tag::RESOURCE_ID, id.as_bytes());
                put_param(out, tag::SYM_PATH, path.to_string().as_bytes());
            }
            Self::LinkFileToResource { file, id } => {
                out.push(2);
                put_param(out, tag::FS_PATH, file.as_bytes());
                put_param(out, tag::RESOURCE_ID, id.as_bytes());
            }
        }
    }

    /// Decodes one command from the front of `bytes`, returning it along
    /// with the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Command, usize), FatalError> {
        if bytes.len() < 2 {
            return Err(FatalError::Malformed("program command header"));
        }
        let op = bytes[0];
        let mut params = Params { bytes: &bytes[2..], consumed: 0 };

        let command = match op {
            opcode::NOOP => Command::Noop,
            opcode::UNLINK_FILE => Command::UnlinkFile { file: params.fs_path()? },
            opcode::UNLINK_PATH => Command::UnlinkPath { path: params.sym_path()? },
            opcode::REMOVE_RESOURCE => Command::RemoveResource { id: params.resource_id()? },
            opcode::LINK_FILE_TO_PATH => {
                let file = params.fs_path()?;
                let path = params.sym_path()?;
                Command::LinkFileToPath { file, path }
            }
            opcode::LINK_RESOURCE_TO_PATH => {
                let id = params.resource_id()?;
                let path = params.sym_path()?;
                Command::LinkResourceToPath { id, path }
            }
            opcode::LINK_FILE_TO_RESOURCE => {
                let file = params.fs_path()?;
                let id = params.resource_id()?;
                Command::LinkFileToResource { file, id }
            }
            other => return Err(FatalError::UnknownOpcode(other)),
        };

        Ok((command, 2 + params.consumed))
    }
}
