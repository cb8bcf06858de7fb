//! Two-pass canonical packing and content hashing.
//!
//! Pass 1 walks the image, interns every kept string in first-use order and
//! sizes the result. Pass 2 copies the non-string region with debug spans
//! removed, writes the fresh string section and rewrites every slot. Two
//! structurally identical classes produce byte-identical output regardless of
//! how their strings were laid out or whether debug information was kept.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::debug;

use aotc_error::{AotError, Result};
use aotc_types::ClassHash;

use crate::layout::{
    ClassImage, HEADER_SIZE, OFF_CLASS_NAME, OFF_FIELD_COUNT, OFF_FIELDS, OFF_IMAGE_SIZE,
    OFF_INTERFACES, OFF_METHOD_COUNT, OFF_METHODS, OFF_SOURCE_FILE, OFF_STRING_SECTION,
    OFF_SUPERCLASS, read_string_at, string_entry_size, write_srp, write_u32_at,
};
use crate::walk::{DebugSpan, ImageVisitor, Slot, walk};

const LAMBDA_MARKER: &str = "$$Lambda";
const LAMBDA_FORM_MARKER: &str = "LambdaForm$";

/// Deterministic prefix of a runtime-generated class name, or `None` when
/// the name is already deterministic.
///
/// `app/Main$$Lambda$17/0x0000000801234` becomes `app/Main$$Lambda` and
/// `java/lang/invoke/LambdaForm$MH/0x00000008000c4` becomes
/// `java/lang/invoke/LambdaForm$MH`.
pub fn deterministic_prefix(name: &str) -> Option<&str> {
    if let Some(pos) = name.find(LAMBDA_MARKER) {
        let end = pos + LAMBDA_MARKER.len();
        return (end < name.len()).then(|| &name[..end]);
    }
    if let Some(pos) = name.find(LAMBDA_FORM_MARKER) {
        let after = pos + LAMBDA_FORM_MARKER.len();
        return name[after..].find('/').map(|slash| &name[..after + slash]);
    }
    None
}

/// Hash already-canonical bytes.
pub fn hash_canonical_bytes(bytes: &[u8]) -> ClassHash {
    let digest = Sha256::digest(bytes);
    let mut raw = [0_u8; ClassHash::LEN];
    raw.copy_from_slice(&digest);
    ClassHash::from_bytes(raw)
}

/// Canonical bytes of a class plus their hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalClass {
    bytes: Vec<u8>,
    hash: ClassHash,
}

impl CanonicalClass {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub const fn hash(&self) -> ClassHash {
        self.hash
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// ---------------------------------------------------------------------------
// Pass 1
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Target {
    Null,
    /// Index into the interned strings.
    String(usize),
    /// Offset in the original non-string region.
    Structural(usize),
}

#[derive(Debug)]
struct PackPlan {
    slots: Vec<(usize, Target)>,
    spans: Vec<DebugSpan>,
    strings: Vec<String>,
    /// Offset of each interned string relative to the section start.
    string_offsets: Vec<usize>,
    original_strings_start: usize,
    pre_string_size: usize,
    total_size: usize,
}

impl PackPlan {
    /// New position of a byte that lived at `pos` in the original image.
    fn relocate(&self, pos: usize) -> usize {
        let removed: usize = self
            .spans
            .iter()
            .take_while(|s| s.start < pos)
            .map(|s| s.len)
            .sum();
        pos - removed
    }

    fn string_target(&self, index: usize) -> usize {
        self.pre_string_size + self.string_offsets[index]
    }
}

struct Interner<'n> {
    rename: Option<(&'n str, &'n str)>,
    index: HashMap<String, usize>,
    strings: Vec<String>,
}

impl Interner<'_> {
    fn intern(&mut self, raw: &str) -> usize {
        let canonical = match self.rename {
            Some((full, prefix)) if raw.contains(full) => raw.replace(full, prefix),
            _ => raw.to_owned(),
        };
        if let Some(&i) = self.index.get(&canonical) {
            return i;
        }
        let i = self.strings.len();
        self.index.insert(canonical.clone(), i);
        self.strings.push(canonical);
        i
    }
}

struct PlanVisitor<'n> {
    strings_start: usize,
    interner: Interner<'n>,
    slots: Vec<(usize, Target)>,
    spans: Vec<DebugSpan>,
}

impl ImageVisitor for PlanVisitor<'_> {
    fn slot(&mut self, image: &[u8], slot: &Slot) -> Result<()> {
        let target = match slot.target {
            None => Target::Null,
            Some(_) if slot.kind.is_debug_only() => Target::Null,
            Some(t) if slot.kind.is_string() => {
                let s = read_string_at(image, t, self.strings_start, image.len())?;
                Target::String(self.interner.intern(s))
            }
            Some(t) => Target::Structural(t),
        };
        self.slots.push((slot.offset, target));
        Ok(())
    }

    fn debug_span(&mut self, span: &DebugSpan) -> Result<()> {
        self.spans.push(*span);
        Ok(())
    }
}

fn finish_plan(
    image: &ClassImage,
    strings: Vec<String>,
    slots: Vec<(usize, Target)>,
    spans: Vec<DebugSpan>,
    pre_string_size: usize,
) -> PackPlan {
    let mut string_offsets = Vec::with_capacity(strings.len());
    let mut cursor = 0;
    for s in &strings {
        string_offsets.push(cursor);
        cursor += string_entry_size(s.len());
    }
    PackPlan {
        slots,
        spans,
        strings,
        string_offsets,
        original_strings_start: image.string_section_offset(),
        pre_string_size,
        total_size: pre_string_size + cursor,
    }
}

fn plan(image: &ClassImage) -> Result<PackPlan> {
    let name = image.name()?;
    let rename = deterministic_prefix(name).map(|prefix| (name, prefix));
    let interner = Interner {
        rename,
        index: HashMap::new(),
        strings: Vec::new(),
    };

    if image.is_array() {
        return plan_array(image, interner);
    }

    let mut visitor = PlanVisitor {
        strings_start: image.string_section_offset(),
        interner,
        slots: Vec::new(),
        spans: Vec::new(),
    };
    walk(image, &mut visitor)?;
    let removed: usize = visitor.spans.iter().map(|s| s.len).sum();
    let pre = image.string_section_offset() - removed;
    Ok(finish_plan(
        image,
        visitor.interner.strings,
        visitor.slots,
        visitor.spans,
        pre,
    ))
}

/// Array classes share their interface table, so the walker cannot be used
/// on them. Their canonical form is a bare header plus the name strings.
fn plan_array(image: &ClassImage, mut interner: Interner<'_>) -> Result<PackPlan> {
    let mut slots = vec![(
        OFF_CLASS_NAME,
        Target::String(interner.intern(image.name()?)),
    )];
    let superclass = match image.superclass_name()? {
        Some(sup) => Target::String(interner.intern(sup)),
        None => Target::Null,
    };
    slots.push((OFF_SUPERCLASS, superclass));
    for off in [OFF_SOURCE_FILE, OFF_INTERFACES, OFF_METHODS, OFF_FIELDS] {
        slots.push((off, Target::Null));
    }
    Ok(finish_plan(
        image,
        interner.strings,
        slots,
        Vec::new(),
        HEADER_SIZE,
    ))
}

// ---------------------------------------------------------------------------
// Pass 2
// ---------------------------------------------------------------------------

fn emit(image: &ClassImage, plan: &PackPlan) -> Result<Vec<u8>> {
    let src = image.as_bytes();
    let mut out = Vec::with_capacity(plan.total_size);

    if image.is_array() {
        out.extend_from_slice(&src[..HEADER_SIZE]);
        for off in [OFF_METHOD_COUNT, OFF_FIELD_COUNT] {
            write_u32_at(&mut out, off, 0);
        }
    } else {
        let mut cursor = 0;
        for span in &plan.spans {
            out.extend_from_slice(&src[cursor..span.start]);
            cursor = span.start + span.len;
        }
        out.extend_from_slice(&src[cursor..plan.original_strings_start]);
        for span in &plan.spans {
            write_u32_at(&mut out, plan.relocate(span.len_cell), 0);
        }
    }
    debug_assert_eq!(out.len(), plan.pre_string_size);

    for s in &plan.strings {
        let len = u16::try_from(s.len())
            .map_err(|_| AotError::malformed_image(format!("string of {} bytes", s.len())))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        if out.len() % 2 == 1 {
            out.push(0);
        }
    }
    debug_assert_eq!(out.len(), plan.total_size);

    for &(offset, target) in &plan.slots {
        let new_target = match target {
            Target::Null => None,
            Target::String(i) => Some(plan.string_target(i)),
            Target::Structural(t) => Some(plan.relocate(t)),
        };
        write_srp(&mut out, plan.relocate(offset), new_target)?;
    }

    let size_field = |v: usize| {
        u32::try_from(v).map_err(|_| AotError::OutOfRange {
            what: "canonical image size".to_owned(),
            value: v.to_string(),
        })
    };
    write_u32_at(&mut out, OFF_IMAGE_SIZE, size_field(plan.total_size)?);
    write_u32_at(&mut out, OFF_STRING_SECTION, size_field(plan.pre_string_size)?);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Size of the canonical form, computed without building it.
pub fn canonical_size(image: &ClassImage) -> Result<usize> {
    Ok(plan(image)?.total_size)
}

/// Canonicalize and hash `image`.
pub fn canonicalize(image: &ClassImage) -> Result<CanonicalClass> {
    let plan = plan(image)?;
    finish(image, &plan)
}

/// Canonicalize and hash `image`, first checking that the canonical size
/// equals `expected_size`. On mismatch no bytes are produced and nothing is
/// hashed.
pub fn canonicalize_checked(image: &ClassImage, expected_size: usize) -> Result<CanonicalClass> {
    let plan = plan(image)?;
    if plan.total_size != expected_size {
        debug!(
            expected = expected_size,
            actual = plan.total_size,
            "canonical size pre-check failed"
        );
        return Err(AotError::CanonicalSizeMismatch {
            expected: expected_size,
            actual: plan.total_size,
        });
    }
    finish(image, &plan)
}

/// Hash of the canonical form of `image`.
pub fn class_hash(image: &ClassImage) -> Result<ClassHash> {
    canonicalize(image).map(|c| c.hash())
}

fn finish(image: &ClassImage, plan: &PackPlan) -> Result<CanonicalClass> {
    let bytes = emit(image, plan)?;
    let hash = hash_canonical_bytes(&bytes);
    debug!(
        original = image.len(),
        canonical = bytes.len(),
        strings = plan.strings.len(),
        debug_spans = plan.spans.len(),
        %hash,
        "canonicalized class image"
    );
    Ok(CanonicalClass { bytes, hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ClassImageBuilder, StringOrder};

    fn widget() -> ClassImageBuilder {
        ClassImageBuilder::new("app/Widget")
            .superclass("java/lang/Object")
            .interface("java/lang/Runnable")
            .interface("java/io/Serializable")
            .method("<init>", "()V", 1, vec![0x2A, 0xB7, 0, 1, 0xB1], Some(vec![1; 9]))
            .method("run", "()V", 1, vec![0xB1], Some(vec![2; 3]))
            .field("count", "I", 2)
            .field("run", "Z", 2)
            .source_file("Widget.java")
    }

    #[test]
    fn test_layout_variants_hash_equal() {
        let reference = class_hash(&widget().build()).unwrap();
        for share in [true, false] {
            for order in [StringOrder::FirstUse, StringOrder::Reversed] {
                for debug in [true, false] {
                    let image = widget()
                        .share_strings(share)
                        .string_order(order)
                        .include_debug(debug)
                        .build();
                    assert_eq!(
                        class_hash(&image).unwrap(),
                        reference,
                        "share={share} order={order:?} debug={debug}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_canonical_form_is_a_fixed_point() {
        let canonical = canonicalize(&widget().share_strings(false).build()).unwrap();
        let reparsed = ClassImage::parse(canonical.bytes().to_vec()).unwrap();
        let again = canonicalize(&reparsed).unwrap();
        assert_eq!(again, canonical);
        assert_eq!(reparsed.source_file().unwrap(), None);
        assert_eq!(reparsed.methods().unwrap()[0].bytecode, &[0x2A, 0xB7, 0, 1, 0xB1]);
    }

    #[test]
    fn test_structural_difference_changes_hash() {
        let base = class_hash(&widget().build()).unwrap();
        let other_code = widget().method("extra", "()V", 1, vec![0xB1], None).build();
        let other_super = ClassImageBuilder::new("app/Widget")
            .superclass("app/Base")
            .build();
        assert_ne!(class_hash(&other_code).unwrap(), base);
        assert_ne!(class_hash(&other_super).unwrap(), base);
    }

    #[test]
    fn test_size_precheck_reports_mismatch() {
        let image = widget().build();
        let size = canonical_size(&image).unwrap();
        assert!(size < image.len());
        assert_eq!(canonicalize_checked(&image, size).unwrap().len(), size);
        let err = canonicalize_checked(&image, size + 4).unwrap_err();
        assert!(matches!(
            err,
            AotError::CanonicalSizeMismatch { expected, actual } if expected == size + 4 && actual == size
        ));
    }

    #[test]
    fn test_lambda_prefix() {
        assert_eq!(
            deterministic_prefix("app/Main$$Lambda$17/0x0000000801234"),
            Some("app/Main$$Lambda")
        );
        assert_eq!(
            deterministic_prefix("java/lang/invoke/LambdaForm$MH/0x00000008000c4"),
            Some("java/lang/invoke/LambdaForm$MH")
        );
        assert_eq!(deterministic_prefix("app/Main"), None);
        assert_eq!(deterministic_prefix("app/Main$$Lambda"), None);
    }

    #[test]
    fn test_lambda_classes_hash_by_prefix() {
        let lambda = |name: &str| {
            ClassImageBuilder::new(name)
                .superclass("java/lang/Object")
                .interface("java/util/function/Supplier")
                .method("get", "()Ljava/lang/Object;", 1, vec![0x01, 0xB0], None)
                .method("self", &format!("()L{name};"), 1, vec![0x2A, 0xB0], None)
                .build()
        };
        let a = canonicalize(&lambda("app/Main$$Lambda$17/0x0000000801234")).unwrap();
        let b = canonicalize(&lambda("app/Main$$Lambda$42/0x00000008055aa")).unwrap();
        assert_eq!(a.hash(), b.hash());
        let reparsed = ClassImage::parse(a.into_bytes()).unwrap();
        assert_eq!(reparsed.name().unwrap(), "app/Main$$Lambda");
        assert_eq!(
            reparsed.methods().unwrap()[1].signature,
            "()Lapp/Main$$Lambda;"
        );
    }

    #[test]
    fn test_array_classes_use_fixed_packer() {
        let a = canonicalize(&ClassImageBuilder::array("[Lapp/Widget;").build()).unwrap();
        let b = canonicalize(
            &ClassImageBuilder::array("[Lapp/Widget;")
                .share_strings(false)
                .string_order(StringOrder::Reversed)
                .build(),
        )
        .unwrap();
        assert_eq!(a, b);
        let other = canonicalize(&ClassImageBuilder::array("[Lapp/Gadget;").build()).unwrap();
        assert_ne!(a.hash(), other.hash());
        let reparsed = ClassImage::parse(a.into_bytes()).unwrap();
        assert!(reparsed.is_array());
        assert_eq!(reparsed.interface_count(), 2);
    }
}
