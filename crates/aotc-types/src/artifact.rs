//! Compiled artifacts and their fix-up tables.
//!
//! An artifact's payload holds, at each fix-up offset, an 8-byte cell that
//! will be rewritten by the client to the local representation of the
//! referenced record. On the server those cells carry no meaning.

use std::fmt;

use aotc_error::{AotError, Result};

use crate::encoding::{
    ByteReader, append_len_prefixed, append_u8, append_u32_le, append_u64_le, len_prefixed_size,
};
use crate::ids::{OptLevel, RecordId, RecordKind, RecordRef};
use crate::record::{Dependencies, read_id};

/// Width of a fix-up cell in the payload.
pub const FIXUP_WIDTH: usize = 8;

const FIXUP_ENCODED_SIZE: usize = 16;
const KEY_ENCODED_SIZE: usize = 8 + 4 + 1 + 3 + 8;

/// Composite key under which a compiled artifact is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ArtifactKey {
    pub defining_chain_id: RecordId,
    pub method_index: u32,
    pub opt_level: OptLevel,
    pub aot_header_id: RecordId,
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain#{}.m{}@{} (header#{})",
            self.defining_chain_id, self.method_index, self.opt_level, self.aot_header_id
        )
    }
}

/// A payload cell that refers to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fixup {
    pub target: RecordRef,
    pub offset: u32,
}

/// An immutable compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    key: ArtifactKey,
    signature: String,
    fixups: Vec<Fixup>,
    payload: Vec<u8>,
}

impl CompiledArtifact {
    /// Build an artifact, checking that every fix-up cell lies inside the
    /// payload.
    pub fn new(
        key: ArtifactKey,
        signature: impl Into<String>,
        fixups: Vec<Fixup>,
        payload: Vec<u8>,
    ) -> Result<Self> {
        for fixup in &fixups {
            let offset = fixup.offset as usize;
            if offset
                .checked_add(FIXUP_WIDTH)
                .is_none_or(|end| end > payload.len())
            {
                return Err(AotError::FixupOutOfBounds {
                    offset,
                    len: payload.len(),
                });
            }
        }
        Ok(Self {
            key,
            signature: signature.into(),
            fixups,
            payload,
        })
    }

    #[inline]
    pub const fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Signature of the compiled method, e.g. `app/Main.run(I)V`.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[inline]
    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Defining chain, compatibility header, then every fix-up target in
    /// table order. May contain repeats.
    #[must_use]
    pub fn dependencies(&self) -> Dependencies {
        let mut deps = Dependencies::new();
        deps.push(RecordRef::new(
            RecordKind::ClassChain,
            self.key.defining_chain_id,
        ));
        deps.push(RecordRef::new(RecordKind::AotHeader, self.key.aot_header_id));
        deps.extend(self.fixups.iter().map(|f| f.target));
        deps
    }

    /// Rewrite the key and fix-up targets through `map`.
    pub fn remap(&self, mut map: impl FnMut(RecordRef) -> Result<RecordId>) -> Result<Self> {
        let key = ArtifactKey {
            defining_chain_id: map(RecordRef::new(
                RecordKind::ClassChain,
                self.key.defining_chain_id,
            ))?,
            aot_header_id: map(RecordRef::new(RecordKind::AotHeader, self.key.aot_header_id))?,
            ..self.key
        };
        let fixups = self
            .fixups
            .iter()
            .map(|f| {
                Ok(Fixup {
                    target: RecordRef::new(f.target.kind, map(f.target)?),
                    offset: f.offset,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            key,
            signature: self.signature.clone(),
            fixups,
            payload: self.payload.clone(),
        })
    }

    /// Encoded size in bytes, including the leading size field.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + KEY_ENCODED_SIZE
            + len_prefixed_size(self.signature.len())
            + 4
            + FIXUP_ENCODED_SIZE * self.fixups.len()
            + len_prefixed_size(self.payload.len())
    }

    /// Append the wire encoding:
    ///
    /// ```text
    /// size:u32 | chain:u64 | method:u32 | opt:u8 | pad:[u8;3] | header:u64
    ///          | signature | fixup_count:u32 | (id:u64 kind:u8 pad:[u8;3] offset:u32)*
    ///          | payload
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the artifact is larger than `u32::MAX` bytes.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        let size = u32::try_from(self.encoded_len()).expect("artifact size exceeds u32");
        append_u32_le(buf, size);
        append_u64_le(buf, self.key.defining_chain_id.get());
        append_u32_le(buf, self.key.method_index);
        append_u8(buf, self.key.opt_level.tag());
        buf.extend_from_slice(&[0_u8; 3]);
        append_u64_le(buf, self.key.aot_header_id.get());
        append_len_prefixed(buf, self.signature.as_bytes());
        let count = u32::try_from(self.fixups.len()).expect("fix-up count exceeds u32");
        append_u32_le(buf, count);
        for fixup in &self.fixups {
            append_u64_le(buf, fixup.target.id.get());
            append_u8(buf, fixup.target.kind.tag());
            buf.extend_from_slice(&[0_u8; 3]);
            append_u32_le(buf, fixup.offset);
        }
        append_len_prefixed(buf, &self.payload);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.append_to(&mut buf);
        buf
    }

    /// Decode one artifact from the front of `bytes`.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(bytes, "artifact");
        let size = reader.read_u32()? as usize;
        if size < 4 || size > bytes.len() {
            return Err(AotError::malformed_record(format!(
                "artifact declares {size} bytes, {} available",
                bytes.len()
            )));
        }
        let mut reader = ByteReader::new(&bytes[4..size], "artifact");
        let key = ArtifactKey {
            defining_chain_id: read_id(&mut reader)?,
            method_index: reader.read_u32()?,
            opt_level: OptLevel::from_tag(reader.read_u8()?)?,
            aot_header_id: {
                reader.skip(3)?;
                read_id(&mut reader)?
            },
        };
        let signature = reader.read_string()?;
        let count = reader.read_count(FIXUP_ENCODED_SIZE)?;
        let mut fixups = Vec::with_capacity(count);
        for _ in 0..count {
            let id = read_id(&mut reader)?;
            let kind = RecordKind::from_tag(reader.read_u8()?)?;
            reader.skip(3)?;
            let offset = reader.read_u32()?;
            fixups.push(Fixup {
                target: RecordRef::new(kind, id),
                offset,
            });
        }
        let payload = reader.read_len_prefixed()?.to_vec();
        reader.finish()?;
        Ok((Self::new(key, signature, fixups, payload)?, size))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (artifact, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(AotError::malformed_record(format!(
                "{} trailing bytes after artifact {}",
                bytes.len() - used,
                artifact.key
            )));
        }
        Ok(artifact)
    }
}
