use std::fmt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A fixed-size, opaque, globally unique binary token identifying a piece of
/// content independent of any path. Immutable once created.
///
/// The lowercase hex string form doubles as the blob filename on disk.
#[repr(transparent)]
#[derive(
    FromBytes, IntoBytes, Immutable, KnownLayout, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ResourceId([u8; ResourceId::LEN]);

impl ResourceId {
    pub const LEN: usize = 16;

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Parses the hex string form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; Self::LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({self})")
    }
}
