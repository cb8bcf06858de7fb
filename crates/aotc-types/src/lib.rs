//! Shared vocabulary of the AOT compilation cache: record ids and kinds,
//! serialization records, compiled artifacts, the client compatibility
//! header, little-endian encoding helpers and the ordered mutex used by every
//! per-kind lock.

pub mod artifact;
pub mod encoding;
pub mod hash;
pub mod header;
pub mod ids;
pub mod lock_order;
pub mod record;

pub use artifact::{ArtifactKey, CompiledArtifact, FIXUP_WIDTH, Fixup};
pub use hash::ClassHash;
pub use header::{
    COMPATIBILITY_HEADER_SIZE, CompatibilityDescriptor, CompatibilityFlags, CompatibilityHeader,
};
pub use ids::{KnownRecords, OptLevel, RecordId, RecordKind, RecordRef};
pub use lock_order::{LockLevel, OrderedGuard, OrderedMutex};
pub use record::{
    AotHeaderRecord, ClassChainRecord, ClassLoaderRecord, ClassRecord, Dependencies, MethodRecord,
    RecordBody, RecordIdentity, SerializationRecord, ThunkRecord, WellKnownClassesRecord,
};
