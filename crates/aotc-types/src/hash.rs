//! Content hash of a canonicalized class image.

use std::fmt;

/// 256-bit digest of a class's canonical metadata bytes.
///
/// Two classes hash equal iff they are compilation-equivalent; the digest is
/// computed by the canonicalizer and only compared everywhere else.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct ClassHash([u8; 32]);

impl ClassHash {
    /// Digest length in bytes.
    pub const LEN: usize = 32;

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes as a little-endian integer, used to pick a shard.
    #[inline]
    #[must_use]
    pub fn shard_key(&self) -> u64 {
        let mut head = [0_u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Display for ClassHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClassHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex digits are plenty to tell hashes apart in logs.
        write!(f, "ClassHash(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
