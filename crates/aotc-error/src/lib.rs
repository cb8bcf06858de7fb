use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for AOT cache operations.
///
/// Budget exhaustion and cache misses are *not* errors: they are reported as
/// `None` / enum values by the store. This type covers the conditions that
/// abort one operation (a snapshot load, a deserialization attempt) without
/// being fatal to the process.
#[derive(Error, Debug)]
pub enum AotError {
    // === Snapshot / persistence errors ===
    /// Snapshot file not found.
    #[error("snapshot not found: '{path}'")]
    SnapshotNotFound { path: PathBuf },

    /// Snapshot file is malformed (bad magic, checksum, truncated body, ...).
    #[error("snapshot is malformed: {detail}")]
    SnapshotCorrupt { detail: String },

    /// Snapshot was written by an incompatible format version.
    #[error("snapshot format version {found} is not supported (expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },

    /// Snapshot content does not fit in the remaining memory budget.
    #[error("snapshot needs {needed} bytes but the memory budget is exhausted")]
    SnapshotTooLarge { needed: usize },

    // === I/O errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === Record errors ===
    /// Serialized record bytes are malformed.
    #[error("malformed serialization record: {detail}")]
    MalformedRecord { detail: String },

    /// Record kind tag is not one of the known kinds.
    #[error("unknown record kind tag {0}")]
    UnknownRecordKind(u8),

    /// Record id 0 is reserved as the invalid sentinel.
    #[error("record id 0 is invalid")]
    InvalidRecordId,

    // === Class image errors ===
    /// Class image bytes violate the layout rules.
    #[error("malformed class image: {detail}")]
    MalformedClassImage { detail: String },

    /// Canonical size pre-check failed; no hash was computed.
    #[error("canonical class size mismatch: expected {expected} bytes, computed {actual}")]
    CanonicalSizeMismatch { expected: usize, actual: usize },

    // === Deserialization errors ===
    /// A record's identity could not be confirmed against the live runtime.
    #[error("identity mismatch for {record}: {reason}")]
    IdentityMismatch { record: String, reason: String },

    /// A record refers to a dependency that is not cached on this client.
    #[error("unresolved dependency {record}")]
    UnresolvedDependency { record: String },

    /// The live runtime has no entity matching a record right now. The
    /// record is left uncached and may resolve on a later attempt.
    #[error("no live entity for {record}: {detail}")]
    EntityNotFound { record: String, detail: String },

    /// The deserializer was reset while this operation was in flight.
    #[error("deserializer was reset concurrently; retry the whole request")]
    ConcurrentReset,

    /// A fix-up entry points outside the artifact payload.
    #[error("fix-up at offset {offset} is outside the {len}-byte payload")]
    FixupOutOfBounds { offset: usize, len: usize },

    // === Internal errors ===
    /// Value out of range.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: String, value: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation is not supported by the selected resolver strategy.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Numeric result codes for reporting cache failures across the process
/// boundary.
///
/// `DeserializationFailure` and `PersistenceFailure` are the codes a
/// compilation request reports when it falls back to compiling without the
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Internal logic error.
    Internal = 1,
    /// File I/O failed.
    Io = 2,
    /// A record or class image is malformed.
    MalformedData = 3,
    /// Canonical size pre-check failed.
    CanonicalMismatch = 4,
    /// Value out of range.
    OutOfRange = 5,
    /// Deserializer state belongs to an older generation.
    ConcurrentReset = 6,
    /// Not supported by the selected resolver strategy.
    Unsupported = 7,
    /// Cached artifact could not be made consumable by this client.
    DeserializationFailure = 8,
    /// Snapshot could not be loaded or written.
    PersistenceFailure = 9,
}

impl AotError {
    /// Map this error to its numeric code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::SnapshotNotFound { .. }
            | Self::SnapshotCorrupt { .. }
            | Self::SnapshotVersion { .. }
            | Self::SnapshotTooLarge { .. } => ErrorCode::PersistenceFailure,
            Self::Io(_) | Self::ShortRead { .. } => ErrorCode::Io,
            Self::MalformedRecord { .. }
            | Self::UnknownRecordKind(_)
            | Self::InvalidRecordId
            | Self::MalformedClassImage { .. } => ErrorCode::MalformedData,
            Self::CanonicalSizeMismatch { .. } => ErrorCode::CanonicalMismatch,
            Self::IdentityMismatch { .. }
            | Self::UnresolvedDependency { .. }
            | Self::EntityNotFound { .. }
            | Self::FixupOutOfBounds { .. } => ErrorCode::DeserializationFailure,
            Self::ConcurrentReset => ErrorCode::ConcurrentReset,
            Self::OutOfRange { .. } => ErrorCode::OutOfRange,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Unsupported(_) => ErrorCode::Unsupported,
        }
    }

    /// Whether retrying the whole request may succeed.
    ///
    /// Only a concurrent reset qualifies: identity mismatches are permanent
    /// for the lifetime of the process and malformed data stays malformed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrentReset)
    }

    /// Human-friendly suggestion for an operator reading the log.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::SnapshotCorrupt { .. } | Self::SnapshotVersion { .. } => {
                Some("Delete the snapshot file; the cache will be rebuilt from scratch")
            }
            Self::SnapshotTooLarge { .. } => {
                Some("Raise the cache memory budget or start with an empty cache")
            }
            Self::ConcurrentReset => Some("Retry the request against the new server instance"),
            Self::IdentityMismatch { .. } => {
                Some("The method will be compiled locally; no action is required")
            }
            _ => None,
        }
    }

    /// Create a corrupt-snapshot error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::SnapshotCorrupt {
            detail: detail.into(),
        }
    }

    /// Create a malformed-record error.
    pub fn malformed_record(detail: impl Into<String>) -> Self {
        Self::MalformedRecord {
            detail: detail.into(),
        }
    }

    /// Create a malformed-class-image error.
    pub fn malformed_image(detail: impl Into<String>) -> Self {
        Self::MalformedClassImage {
            detail: detail.into(),
        }
    }

    /// Create an identity-mismatch error.
    pub fn identity_mismatch(record: impl ToString, reason: impl Into<String>) -> Self {
        Self::IdentityMismatch {
            record: record.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an entity-not-found error.
    pub fn entity_not_found(record: impl ToString, detail: impl Into<String>) -> Self {
        Self::EntityNotFound {
            record: record.to_string(),
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `AotError`.
pub type Result<T> = std::result::Result<T, AotError>;
