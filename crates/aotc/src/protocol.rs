//! Request and response messages exchanged between a client and the
//! cache server, with their wire encoding.
//!
//! All integers are little-endian; strings and byte blobs carry a `u32`
//! length prefix. Records and artifacts use their own encodings.
//!
//! ```text
//! request  = version:u8 | cache_name | client_id:u64 | ack_server_uid:u64
//!            | header:[u8;64] | method | known
//! method   = method_index:u32 | opt_level:u8 | signature | count:u32
//!            | (loader_first_class | image)*
//! known    = reset:u8 | count:u32 (kind:u8 id:u64)* | count:u32 (kind:u8 id:u64)*
//! response = version:u8 | tag:u8 | server_uid:u64 | body
//! ```

use aotc_canon::ClassImage;
use aotc_client::KnownIdsUpdate;
use aotc_error::{AotError, Result};
use aotc_types::encoding::{
    ByteReader, append_len_prefixed, append_u8, append_u32_le, append_u64_le,
};
use aotc_types::{
    COMPATIBILITY_HEADER_SIZE, CompatibilityHeader, CompiledArtifact, OptLevel, RecordId,
    RecordKind, RecordRef, SerializationRecord,
};

/// Version byte leading every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// One class of a method's defining chain, as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    /// First class loaded by the class's loader.
    pub loader_first_class: String,
    pub image: ClassImage,
}

/// The method a client wants compiled code for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// The defining class, then its ancestors and interfaces.
    pub chain: Vec<ClassDescriptor>,
    pub method_index: u32,
    pub opt_level: OptLevel,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AotCacheRequest {
    pub cache_name: String,
    pub client_id: u64,
    /// Server instance whose ids `known` refers to; 0 before the client
    /// has seen any response.
    pub ack_server_uid: u64,
    pub header: CompatibilityHeader,
    pub method: MethodDescriptor,
    /// Acknowledgement of ids the client cached or purged since its last
    /// request.
    pub known: KnownIdsUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AotCacheResponse {
    Miss {
        server_uid: u64,
    },
    /// The artifact plus, in dependency order, every record the client
    /// does not have yet.
    Hit {
        server_uid: u64,
        artifact: CompiledArtifact,
        records: Vec<SerializationRecord>,
    },
    /// The server cannot serve this request, e.g. its budget is exhausted.
    Unavailable {
        server_uid: u64,
        reason: String,
    },
}

impl AotCacheResponse {
    pub const fn server_uid(&self) -> u64 {
        match self {
            Self::Miss { server_uid }
            | Self::Hit { server_uid, .. }
            | Self::Unavailable { server_uid, .. } => *server_uid,
        }
    }

    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

const TAG_MISS: u8 = 0;
const TAG_HIT: u8 = 1;
const TAG_UNAVAILABLE: u8 = 2;

fn append_refs(buf: &mut Vec<u8>, refs: &[RecordRef]) {
    let count = u32::try_from(refs.len()).expect("ref list length exceeds u32");
    append_u32_le(buf, count);
    for r in refs {
        append_u8(buf, r.kind.tag());
        append_u64_le(buf, r.id.get());
    }
}

fn read_refs(reader: &mut ByteReader<'_>) -> Result<Vec<RecordRef>> {
    let count = reader.read_count(9)?;
    (0..count)
        .map(|_| {
            let kind = RecordKind::from_tag(reader.read_u8()?)?;
            let id = RecordId::try_from(reader.read_u64()?)?;
            Ok(RecordRef::new(kind, id))
        })
        .collect()
}

fn read_version(reader: &mut ByteReader<'_>) -> Result<()> {
    let version = reader.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(AotError::malformed_record(format!(
            "protocol version {version} is not supported (expected {PROTOCOL_VERSION})"
        )));
    }
    Ok(())
}

impl AotCacheRequest {
    /// # Panics
    ///
    /// Panics if a string, image or list is longer than `u32::MAX`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        append_u8(&mut buf, PROTOCOL_VERSION);
        append_len_prefixed(&mut buf, self.cache_name.as_bytes());
        append_u64_le(&mut buf, self.client_id);
        append_u64_le(&mut buf, self.ack_server_uid);
        buf.extend_from_slice(self.header.as_bytes());

        let m = &self.method;
        append_u32_le(&mut buf, m.method_index);
        append_u8(&mut buf, m.opt_level.tag());
        append_len_prefixed(&mut buf, m.signature.as_bytes());
        let count = u32::try_from(m.chain.len()).expect("chain length exceeds u32");
        append_u32_le(&mut buf, count);
        for class in &m.chain {
            append_len_prefixed(&mut buf, class.loader_first_class.as_bytes());
            append_len_prefixed(&mut buf, class.image.as_bytes());
        }

        append_u8(&mut buf, u8::from(self.known.reset));
        append_refs(&mut buf, &self.known.newly_cached);
        append_refs(&mut buf, &self.known.forgotten);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes, "cache request");
        read_version(&mut reader)?;
        let cache_name = reader.read_string()?;
        let client_id = reader.read_u64()?;
        let ack_server_uid = reader.read_u64()?;
        let header = CompatibilityHeader::from_bytes(reader.read_array::<COMPATIBILITY_HEADER_SIZE>()?);

        let method_index = reader.read_u32()?;
        let opt_level = OptLevel::from_tag(reader.read_u8()?)?;
        let signature = reader.read_string()?;
        let count = reader.read_count(8)?;
        let chain = (0..count)
            .map(|_| {
                let loader_first_class = reader.read_string()?;
                let image = ClassImage::parse(reader.read_len_prefixed()?.to_vec())?;
                Ok(ClassDescriptor {
                    loader_first_class,
                    image,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let reset = match reader.read_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(AotError::malformed_record(format!("reset flag {other}")));
            }
        };
        let newly_cached = read_refs(&mut reader)?;
        let forgotten = read_refs(&mut reader)?;
        reader.finish()?;
        Ok(Self {
            cache_name,
            client_id,
            ack_server_uid,
            header,
            method: MethodDescriptor {
                chain,
                method_index,
                opt_level,
                signature,
            },
            known: KnownIdsUpdate {
                reset,
                newly_cached,
                forgotten,
            },
        })
    }
}

impl AotCacheResponse {
    /// # Panics
    ///
    /// Panics if the record list or reason is longer than `u32::MAX`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        append_u8(&mut buf, PROTOCOL_VERSION);
        match self {
            Self::Miss { server_uid } => {
                append_u8(&mut buf, TAG_MISS);
                append_u64_le(&mut buf, *server_uid);
            }
            Self::Hit {
                server_uid,
                artifact,
                records,
            } => {
                append_u8(&mut buf, TAG_HIT);
                append_u64_le(&mut buf, *server_uid);
                artifact.append_to(&mut buf);
                let count = u32::try_from(records.len()).expect("record count exceeds u32");
                append_u32_le(&mut buf, count);
                for record in records {
                    record.append_to(&mut buf);
                }
            }
            Self::Unavailable { server_uid, reason } => {
                append_u8(&mut buf, TAG_UNAVAILABLE);
                append_u64_le(&mut buf, *server_uid);
                append_len_prefixed(&mut buf, reason.as_bytes());
            }
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes, "cache response");
        read_version(&mut reader)?;
        let tag = reader.read_u8()?;
        let server_uid = reader.read_u64()?;
        let response = match tag {
            TAG_MISS => Self::Miss { server_uid },
            TAG_HIT => {
                let (artifact, used) = CompiledArtifact::decode_prefix(&bytes[reader.position()..])?;
                reader.skip(used)?;
                let count = reader.read_count(16)?;
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    let (record, used) =
                        SerializationRecord::decode_prefix(&bytes[reader.position()..])?;
                    reader.skip(used)?;
                    records.push(record);
                }
                Self::Hit {
                    server_uid,
                    artifact,
                    records,
                }
            }
            TAG_UNAVAILABLE => Self::Unavailable {
                server_uid,
                reason: reader.read_string()?,
            },
            other => {
                return Err(AotError::malformed_record(format!("response tag {other}")));
            }
        };
        reader.finish()?;
        Ok(response)
    }
}
