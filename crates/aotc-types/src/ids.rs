//! Record identifiers, record kinds and optimization levels.

use std::fmt;
use std::num::NonZeroU64;

use aotc_error::{AotError, Result};

/// Dense numeric id of a serialization record.
///
/// Ids are unique within one record kind of one cache instance and start at
/// 1; 0 is the invalid sentinel and cannot be represented.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RecordId(NonZeroU64);

impl RecordId {
    /// The first id handed out by a fresh record table.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Create a record id from a raw value.
    ///
    /// Returns `None` for the sentinel value 0.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Zero-based position of this id in its table's insertion order.
    #[inline]
    pub fn index(self) -> usize {
        usize::try_from(self.0.get() - 1).unwrap_or(usize::MAX)
    }

    /// The id that follows this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for RecordId {
    type Error = AotError;

    fn try_from(value: u64) -> Result<Self> {
        Self::new(value).ok_or(AotError::InvalidRecordId)
    }
}

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

/// The closed set of serialization record kinds.
///
/// The discriminant doubles as the on-wire tag, and the declaration order is
/// the fixed order used by snapshots and by lock acquisition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum RecordKind {
    ClassLoader = 0,
    Class = 1,
    Method = 2,
    ClassChain = 3,
    WellKnownClasses = 4,
    AotHeader = 5,
    Thunk = 6,
}

impl RecordKind {
    /// Number of record kinds.
    pub const COUNT: usize = 7;

    /// All kinds in their fixed order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::ClassLoader,
        Self::Class,
        Self::Method,
        Self::ClassChain,
        Self::WellKnownClasses,
        Self::AotHeader,
        Self::Thunk,
    ];

    /// Decode a wire tag.
    pub const fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::ClassLoader),
            1 => Ok(Self::Class),
            2 => Ok(Self::Method),
            3 => Ok(Self::ClassChain),
            4 => Ok(Self::WellKnownClasses),
            5 => Ok(Self::AotHeader),
            6 => Ok(Self::Thunk),
            other => Err(AotError::UnknownRecordKind(other)),
        }
    }

    /// The wire tag.
    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Position in [`RecordKind::ALL`].
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short lowercase name used in logs and diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ClassLoader => "class_loader",
            Self::Class => "class",
            Self::Method => "method",
            Self::ClassChain => "class_chain",
            Self::WellKnownClasses => "well_known_classes",
            Self::AotHeader => "aot_header",
            Self::Thunk => "thunk",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// RecordRef
// ---------------------------------------------------------------------------

/// `(kind, id)` pair: the only way one record refers to another.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: RecordId,
}

impl RecordRef {
    #[inline]
    #[must_use]
    pub const fn new(kind: RecordKind, id: RecordId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Set of records a client is known to hold.
pub type KnownRecords = std::collections::HashSet<RecordRef>;

// ---------------------------------------------------------------------------
// OptLevel
// ---------------------------------------------------------------------------

/// Optimization level a method was compiled at; part of the artifact key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum OptLevel {
    NoOpt = 0,
    Cold = 1,
    Warm = 2,
    Hot = 3,
    VeryHot = 4,
    Scorching = 5,
}

impl OptLevel {
    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::NoOpt),
            1 => Ok(Self::Cold),
            2 => Ok(Self::Warm),
            3 => Ok(Self::Hot),
            4 => Ok(Self::VeryHot),
            5 => Ok(Self::Scorching),
            other => Err(AotError::OutOfRange {
                what: "optimization level".to_owned(),
                value: other.to_string(),
            }),
        }
    }

    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoOpt => "noOpt",
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
            Self::VeryHot => "veryHot",
            Self::Scorching => "scorching",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_zero_is_invalid() {
        assert!(RecordId::new(0).is_none());
        assert!(matches!(
            RecordId::try_from(0),
            Err(AotError::InvalidRecordId)
        ));
        assert_eq!(RecordId::FIRST.get(), 1);
        assert_eq!(RecordId::FIRST.index(), 0);
        assert_eq!(RecordId::FIRST.next().get(), 2);
    }

    #[test]
    fn test_kind_tags_roundtrip_in_fixed_order() {
        for (pos, kind) in RecordKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), pos);
            assert_eq!(RecordKind::from_tag(kind.tag()).unwrap(), *kind);
        }
        assert!(matches!(
            RecordKind::from_tag(7),
            Err(AotError::UnknownRecordKind(7))
        ));
    }

    #[test]
    fn test_record_ref_display() {
        let r = RecordRef::new(RecordKind::ClassChain, RecordId::new(12).unwrap());
        assert_eq!(r.to_string(), "class_chain#12");
    }

    #[test]
    fn test_opt_level_tags() {
        assert_eq!(OptLevel::from_tag(3).unwrap(), OptLevel::Hot);
        assert!(OptLevel::from_tag(9).is_err());
        assert!(OptLevel::Warm < OptLevel::Scorching);
    }
}
