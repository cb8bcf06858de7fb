//! Class metadata canonicalization.
//!
//! Turns a loaded class image into a byte sequence that is identical for any
//! two compilation-equivalent classes, and hashes it with SHA-256. See
//! [`pack`] for the algorithm and [`layout`] for the image format.

pub mod builder;
pub mod layout;
pub mod pack;
pub mod walk;

pub use builder::{ClassImageBuilder, StringOrder};
pub use layout::{ARRAY_INTERFACES, ClassFlags, ClassImage, MethodView};
pub use pack::{
    CanonicalClass, canonical_size, canonicalize, canonicalize_checked, class_hash,
    deterministic_prefix, hash_canonical_bytes,
};
pub use walk::{DebugSpan, ImageVisitor, Slot, SlotKind, walk};
