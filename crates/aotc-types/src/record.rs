//! Serialization records.
//!
//! A [`SerializationRecord`] is an immutable `(id, body)` pair. The body is a
//! closed sum over the record kinds; records refer to one another only by
//! [`RecordRef`], so an encoded record can be copied across processes
//! byte-for-byte.
//!
//! Wire layout (little-endian):
//!
//! ```text
//! size:u32 | kind:u8 | pad:[u8;3] | id:u64 | body
//! ```
//!
//! `size` covers the whole record including the 16-byte header.

use smallvec::SmallVec;

use aotc_error::{AotError, Result};

use crate::encoding::{
    ByteReader, append_len_prefixed, append_u8, append_u32_le, append_u64_le, len_prefixed_size,
};
use crate::hash::ClassHash;
use crate::header::{COMPATIBILITY_HEADER_SIZE, CompatibilityHeader};
use crate::ids::{RecordId, RecordKind, RecordRef};

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Dependency list; most records have at most a handful.
pub type Dependencies = SmallVec<[RecordRef; 4]>;

// ---------------------------------------------------------------------------
// Record bodies
// ---------------------------------------------------------------------------

/// A class loader, identified by the name of the first class it loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassLoaderRecord {
    pub first_class_name: String,
}

/// A class, identified by its loader and canonical content hash.
///
/// `name` and `canonical_size` are carried so a client can look the class up
/// and pre-check its own canonical form before hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRecord {
    pub class_loader_id: RecordId,
    pub hash: ClassHash,
    pub canonical_size: u32,
    pub name: String,
}

/// A method, identified by its defining class and index within that class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRecord {
    pub class_id: RecordId,
    pub index: u32,
}

/// Ordered class ids: the class itself, then its ancestors and interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassChainRecord {
    pub class_ids: Vec<RecordId>,
}

impl ClassChainRecord {
    /// Construct a chain; the chain must contain at least the class itself.
    pub fn new(class_ids: Vec<RecordId>) -> Result<Self> {
        if class_ids.is_empty() {
            return Err(AotError::malformed_record("class chain is empty"));
        }
        Ok(Self { class_ids })
    }

    /// Id of the class the chain describes.
    #[must_use]
    pub fn first_class_id(&self) -> RecordId {
        self.class_ids[0]
    }
}

/// Chains of the well-known classes a client had loaded, plus a bitmask of
/// which well-known slots were populated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WellKnownClassesRecord {
    pub chain_ids: Vec<RecordId>,
    pub include_mask: u64,
}

impl WellKnownClassesRecord {
    /// Construct the record; the mask must have one bit set per chain.
    pub fn new(chain_ids: Vec<RecordId>, include_mask: u64) -> Result<Self> {
        if include_mask.count_ones() as usize != chain_ids.len() {
            return Err(AotError::malformed_record(format!(
                "well-known mask {include_mask:#x} does not match {} chains",
                chain_ids.len()
            )));
        }
        Ok(Self {
            chain_ids,
            include_mask,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AotHeaderRecord {
    pub header: CompatibilityHeader,
}

/// A calling-convention thunk. Only the signature takes part in identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkRecord {
    pub signature: String,
    pub code: Vec<u8>,
}

/// Kind-specific payload of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    ClassLoader(ClassLoaderRecord),
    Class(ClassRecord),
    Method(MethodRecord),
    ClassChain(ClassChainRecord),
    WellKnownClasses(WellKnownClassesRecord),
    AotHeader(AotHeaderRecord),
    Thunk(ThunkRecord),
}

/// The deduplication key of a record, distinct from its assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordIdentity {
    ClassLoader {
        first_class_name: String,
    },
    Class {
        class_loader_id: RecordId,
        hash: ClassHash,
    },
    Method {
        class_id: RecordId,
        index: u32,
    },
    ClassChain {
        class_ids: Vec<RecordId>,
    },
    WellKnownClasses {
        chain_ids: Vec<RecordId>,
        include_mask: u64,
    },
    AotHeader {
        header: CompatibilityHeader,
    },
    Thunk {
        signature: String,
    },
}

impl RecordIdentity {
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::ClassLoader { .. } => RecordKind::ClassLoader,
            Self::Class { .. } => RecordKind::Class,
            Self::Method { .. } => RecordKind::Method,
            Self::ClassChain { .. } => RecordKind::ClassChain,
            Self::WellKnownClasses { .. } => RecordKind::WellKnownClasses,
            Self::AotHeader { .. } => RecordKind::AotHeader,
            Self::Thunk { .. } => RecordKind::Thunk,
        }
    }
}

fn ids_to_refs(kind: RecordKind, ids: &[RecordId]) -> impl Iterator<Item = RecordRef> + '_ {
    ids.iter().map(move |id| RecordRef::new(kind, *id))
}

impl RecordBody {
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::ClassLoader(_) => RecordKind::ClassLoader,
            Self::Class(_) => RecordKind::Class,
            Self::Method(_) => RecordKind::Method,
            Self::ClassChain(_) => RecordKind::ClassChain,
            Self::WellKnownClasses(_) => RecordKind::WellKnownClasses,
            Self::AotHeader(_) => RecordKind::AotHeader,
            Self::Thunk(_) => RecordKind::Thunk,
        }
    }

    #[must_use]
    pub fn identity(&self) -> RecordIdentity {
        match self {
            Self::ClassLoader(r) => RecordIdentity::ClassLoader {
                first_class_name: r.first_class_name.clone(),
            },
            Self::Class(r) => RecordIdentity::Class {
                class_loader_id: r.class_loader_id,
                hash: r.hash,
            },
            Self::Method(r) => RecordIdentity::Method {
                class_id: r.class_id,
                index: r.index,
            },
            Self::ClassChain(r) => RecordIdentity::ClassChain {
                class_ids: r.class_ids.clone(),
            },
            Self::WellKnownClasses(r) => RecordIdentity::WellKnownClasses {
                chain_ids: r.chain_ids.clone(),
                include_mask: r.include_mask,
            },
            Self::AotHeader(r) => RecordIdentity::AotHeader { header: r.header },
            Self::Thunk(r) => RecordIdentity::Thunk {
                signature: r.signature.clone(),
            },
        }
    }

    /// Records this body refers to, in field order.
    #[must_use]
    pub fn dependencies(&self) -> Dependencies {
        match self {
            Self::ClassLoader(_) | Self::AotHeader(_) | Self::Thunk(_) => Dependencies::new(),
            Self::Class(r) => {
                smallvec::smallvec![RecordRef::new(RecordKind::ClassLoader, r.class_loader_id)]
            }
            Self::Method(r) => smallvec::smallvec![RecordRef::new(RecordKind::Class, r.class_id)],
            Self::ClassChain(r) => ids_to_refs(RecordKind::Class, &r.class_ids).collect(),
            Self::WellKnownClasses(r) => ids_to_refs(RecordKind::ClassChain, &r.chain_ids).collect(),
        }
    }

    /// Rewrite every dependency id through `map`, e.g. when a snapshot is
    /// loaded and ids are renumbered.
    pub fn remap(&self, mut map: impl FnMut(RecordRef) -> Result<RecordId>) -> Result<Self> {
        let mut remap_all = |kind: RecordKind, ids: &[RecordId]| -> Result<Vec<RecordId>> {
            ids.iter()
                .map(|id| map(RecordRef::new(kind, *id)))
                .collect()
        };
        Ok(match self {
            Self::ClassLoader(_) | Self::AotHeader(_) | Self::Thunk(_) => self.clone(),
            Self::Class(r) => Self::Class(ClassRecord {
                class_loader_id: remap_all(RecordKind::ClassLoader, &[r.class_loader_id])?[0],
                ..r.clone()
            }),
            Self::Method(r) => Self::Method(MethodRecord {
                class_id: remap_all(RecordKind::Class, &[r.class_id])?[0],
                index: r.index,
            }),
            Self::ClassChain(r) => Self::ClassChain(ClassChainRecord {
                class_ids: remap_all(RecordKind::Class, &r.class_ids)?,
            }),
            Self::WellKnownClasses(r) => Self::WellKnownClasses(WellKnownClassesRecord {
                chain_ids: remap_all(RecordKind::ClassChain, &r.chain_ids)?,
                include_mask: r.include_mask,
            }),
        })
    }

    fn body_len(&self) -> usize {
        match self {
            Self::ClassLoader(r) => len_prefixed_size(r.first_class_name.len()),
            Self::Class(r) => 8 + ClassHash::LEN + 4 + len_prefixed_size(r.name.len()),
            Self::Method(_) => 8 + 4,
            Self::ClassChain(r) => 4 + 8 * r.class_ids.len(),
            Self::WellKnownClasses(r) => 8 + 4 + 8 * r.chain_ids.len(),
            Self::AotHeader(_) => COMPATIBILITY_HEADER_SIZE,
            Self::Thunk(r) => len_prefixed_size(r.signature.len()) + len_prefixed_size(r.code.len()),
        }
    }

    fn append_body(&self, buf: &mut Vec<u8>) {
        match self {
            Self::ClassLoader(r) => append_len_prefixed(buf, r.first_class_name.as_bytes()),
            Self::Class(r) => {
                append_u64_le(buf, r.class_loader_id.get());
                buf.extend_from_slice(r.hash.as_bytes());
                append_u32_le(buf, r.canonical_size);
                append_len_prefixed(buf, r.name.as_bytes());
            }
            Self::Method(r) => {
                append_u64_le(buf, r.class_id.get());
                append_u32_le(buf, r.index);
            }
            Self::ClassChain(r) => append_id_list(buf, &r.class_ids),
            Self::WellKnownClasses(r) => {
                append_u64_le(buf, r.include_mask);
                append_id_list(buf, &r.chain_ids);
            }
            Self::AotHeader(r) => buf.extend_from_slice(r.header.as_bytes()),
            Self::Thunk(r) => {
                append_len_prefixed(buf, r.signature.as_bytes());
                append_len_prefixed(buf, &r.code);
            }
        }
    }

    fn read_body(kind: RecordKind, reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match kind {
            RecordKind::ClassLoader => Self::ClassLoader(ClassLoaderRecord {
                first_class_name: reader.read_string()?,
            }),
            RecordKind::Class => Self::Class(ClassRecord {
                class_loader_id: read_id(reader)?,
                hash: ClassHash::from_bytes(reader.read_array()?),
                canonical_size: reader.read_u32()?,
                name: reader.read_string()?,
            }),
            RecordKind::Method => Self::Method(MethodRecord {
                class_id: read_id(reader)?,
                index: reader.read_u32()?,
            }),
            RecordKind::ClassChain => {
                Self::ClassChain(ClassChainRecord::new(read_id_list(reader)?)?)
            }
            RecordKind::WellKnownClasses => {
                let mask = reader.read_u64()?;
                Self::WellKnownClasses(WellKnownClassesRecord::new(read_id_list(reader)?, mask)?)
            }
            RecordKind::AotHeader => Self::AotHeader(AotHeaderRecord {
                header: CompatibilityHeader::from_bytes(reader.read_array()?),
            }),
            RecordKind::Thunk => Self::Thunk(ThunkRecord {
                signature: reader.read_string()?,
                code: reader.read_len_prefixed()?.to_vec(),
            }),
        })
    }
}

fn append_id_list(buf: &mut Vec<u8>, ids: &[RecordId]) {
    let count = u32::try_from(ids.len()).expect("id list length exceeds u32");
    append_u32_le(buf, count);
    for id in ids {
        append_u64_le(buf, id.get());
    }
}

pub(crate) fn read_id(reader: &mut ByteReader<'_>) -> Result<RecordId> {
    RecordId::try_from(reader.read_u64()?)
}

fn read_id_list(reader: &mut ByteReader<'_>) -> Result<Vec<RecordId>> {
    let count = reader.read_count(8)?;
    (0..count).map(|_| read_id(reader)).collect()
}

// ---------------------------------------------------------------------------
// SerializationRecord
// ---------------------------------------------------------------------------

/// An immutable, id-tagged serialization record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationRecord {
    id: RecordId,
    body: RecordBody,
}

impl SerializationRecord {
    #[must_use]
    pub const fn new(id: RecordId, body: RecordBody) -> Self {
        Self { id, body }
    }

    #[inline]
    pub const fn id(&self) -> RecordId {
        self.id
    }

    #[inline]
    pub const fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    #[inline]
    pub const fn body(&self) -> &RecordBody {
        &self.body
    }

    #[inline]
    pub const fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.kind(), self.id)
    }

    #[must_use]
    pub fn identity(&self) -> RecordIdentity {
        self.body.identity()
    }

    #[must_use]
    pub fn dependencies(&self) -> Dependencies {
        self.body.dependencies()
    }

    /// Encoded size in bytes, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body.body_len()
    }

    /// Append the wire encoding to `buf`.
    ///
    /// # Panics
    ///
    /// Panics if the record is larger than `u32::MAX` bytes.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        let size = u32::try_from(self.encoded_len()).expect("record size exceeds u32");
        append_u32_le(buf, size);
        append_u8(buf, self.kind().tag());
        buf.extend_from_slice(&[0_u8; 3]);
        append_u64_le(buf, self.id.get());
        self.body.append_body(buf);
        debug_assert_eq!(buf.len() - start, self.encoded_len());
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.append_to(&mut buf);
        buf
    }

    /// Decode one record from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut header = ByteReader::new(bytes, "record header");
        let size = header.read_u32()? as usize;
        let kind = RecordKind::from_tag(header.read_u8()?)?;
        header.skip(3)?;
        let id = read_id(&mut header)?;
        if size < RECORD_HEADER_SIZE || size > bytes.len() {
            return Err(AotError::malformed_record(format!(
                "{kind} record declares {size} bytes, {} available",
                bytes.len()
            )));
        }
        let mut body = ByteReader::new(&bytes[RECORD_HEADER_SIZE..size], "record body");
        let decoded = RecordBody::read_body(kind, &mut body)?;
        body.finish()?;
        Ok((Self::new(id, decoded), size))
    }

    /// Decode a record that must span all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (record, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(AotError::malformed_record(format!(
                "{} trailing bytes after {}",
                bytes.len() - used,
                record.record_ref()
            )));
        }
        Ok(record)
    }
}
