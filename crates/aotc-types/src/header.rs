//! Client compatibility header.
//!
//! The header is an opaque fixed-size descriptor: the cache only ever compares
//! it byte-for-byte. [`CompatibilityDescriptor`] is the structured form a
//! client fills in before encoding it.

use std::fmt;

use aotc_error::{AotError, Result};

use crate::encoding::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};

/// Size of an encoded compatibility header.
pub const COMPATIBILITY_HEADER_SIZE: usize = 64;

const HEADER_EYECATCHER: u32 = u32::from_le_bytes(*b"AOTH");

/// Opaque compatibility descriptor of the originating client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompatibilityHeader([u8; COMPATIBILITY_HEADER_SIZE]);

impl CompatibilityHeader {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; COMPATIBILITY_HEADER_SIZE]) -> Self {
        Self(bytes)
    }

    /// Construct from a slice of exactly [`COMPATIBILITY_HEADER_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; COMPATIBILITY_HEADER_SIZE] =
            bytes.try_into().map_err(|_| AotError::ShortRead {
                expected: COMPATIBILITY_HEADER_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(raw))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; COMPATIBILITY_HEADER_SIZE] {
        &self.0
    }
}

impl fmt::Debug for CompatibilityHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match CompatibilityDescriptor::decode(self) {
            Ok(desc) => f.debug_tuple("CompatibilityHeader").field(&desc).finish(),
            Err(_) => f.write_str("CompatibilityHeader(<opaque>)"),
        }
    }
}

bitflags::bitflags! {
    /// Runtime features that change the shape of generated code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompatibilityFlags: u32 {
        const COMPRESSED_REFS = 0x01;
        const CONCURRENT_SCAVENGE = 0x02;
        const SOFTWARE_READ_BARRIER = 0x04;
        const TLH_PREFETCH = 0x08;
        const METHOD_TRACING = 0x10;
        const FSD = 0x20;
    }
}

/// Structured form of a [`CompatibilityHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibilityDescriptor {
    pub vm_version: u32,
    pub flags: CompatibilityFlags,
    pub processor_features: u64,
    pub gc_policy: u32,
    pub compressed_refs_shift: u32,
    pub object_alignment: u32,
}

impl Default for CompatibilityDescriptor {
    fn default() -> Self {
        Self {
            vm_version: 1,
            flags: CompatibilityFlags::COMPRESSED_REFS,
            processor_features: 0,
            gc_policy: 0,
            compressed_refs_shift: 3,
            object_alignment: 8,
        }
    }
}

impl CompatibilityDescriptor {
    /// Encode into the fixed-size header. Unused trailing bytes are zero.
    #[must_use]
    pub fn encode(&self) -> CompatibilityHeader {
        let mut raw = [0_u8; COMPATIBILITY_HEADER_SIZE];
        write_u32_le(&mut raw, 0, HEADER_EYECATCHER);
        write_u32_le(&mut raw, 4, self.vm_version);
        write_u32_le(&mut raw, 8, self.flags.bits());
        write_u32_le(&mut raw, 12, self.gc_policy);
        write_u64_le(&mut raw, 16, self.processor_features);
        write_u32_le(&mut raw, 24, self.compressed_refs_shift);
        write_u32_le(&mut raw, 28, self.object_alignment);
        CompatibilityHeader(raw)
    }

    /// Decode a header produced by [`encode`](Self::encode).
    pub fn decode(header: &CompatibilityHeader) -> Result<Self> {
        let raw = header.as_bytes();
        let field = |offset: usize| {
            read_u32_le(raw, offset)
                .ok_or_else(|| AotError::malformed_record("compatibility header truncated"))
        };
        if field(0)? != HEADER_EYECATCHER {
            return Err(AotError::malformed_record(
                "compatibility header eye-catcher mismatch",
            ));
        }
        let flags_raw = field(8)?;
        let flags = CompatibilityFlags::from_bits(flags_raw).ok_or_else(|| {
            AotError::malformed_record(format!("unknown compatibility flags {flags_raw:#x}"))
        })?;
        Ok(Self {
            vm_version: field(4)?,
            flags,
            gc_policy: field(12)?,
            processor_features: read_u64_le(raw, 16)
                .ok_or_else(|| AotError::malformed_record("compatibility header truncated"))?,
            compressed_refs_shift: field(24)?,
            object_alignment: field(28)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_encode_decode() {
        let desc = CompatibilityDescriptor {
            vm_version: 17,
            flags: CompatibilityFlags::COMPRESSED_REFS | CompatibilityFlags::FSD,
            processor_features: 0xF00D,
            gc_policy: 2,
            compressed_refs_shift: 0,
            object_alignment: 16,
        };
        let header = desc.encode();
        assert_eq!(CompatibilityDescriptor::decode(&header).unwrap(), desc);
    }

    #[test]
    fn test_headers_compare_bytewise() {
        let a = CompatibilityDescriptor::default().encode();
        let b = CompatibilityDescriptor {
            gc_policy: 1,
            ..CompatibilityDescriptor::default()
        }
        .encode();
        assert_ne!(a, b);
        assert_eq!(a, CompatibilityDescriptor::default().encode());
    }

    #[test]
    fn test_opaque_header_decode_fails() {
        let header = CompatibilityHeader::from_bytes([0xAA; COMPATIBILITY_HEADER_SIZE]);
        assert!(CompatibilityDescriptor::decode(&header).is_err());
        assert_eq!(format!("{header:?}"), "CompatibilityHeader(<opaque>)");
    }

    #[test]
    fn test_from_slice_length_checked() {
        assert!(CompatibilityHeader::from_slice(&[0_u8; 10]).is_err());
        assert!(CompatibilityHeader::from_slice(&[0_u8; COMPATIBILITY_HEADER_SIZE]).is_ok());
    }
}
