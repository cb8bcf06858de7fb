//! Slot walker.
//!
//! Visits every cross-reference slot of a class image in a fixed order and
//! every inline debug span. The order is what makes the canonical string
//! section deterministic, so it must not depend on the original layout:
//!
//! 1. class name, superclass name, source file
//! 2. the interface, method and field table pointers
//! 3. each interface name
//! 4. for each method: name, signature, then its debug span
//! 5. for each field: name, signature

use aotc_error::{AotError, Result};

use crate::layout::{
    ClassImage, HEADER_SIZE, METHOD_ENTRY_HEADER, METHOD_OFF_BYTECODE_LEN, METHOD_OFF_DEBUG_LEN,
    METHOD_OFF_NAME, METHOD_OFF_SIGNATURE, OFF_CLASS_NAME, OFF_FIELDS, OFF_INTERFACES,
    OFF_METHODS, OFF_SOURCE_FILE, OFF_SUPERCLASS, pad4, read_string_at, read_usize_at,
    resolve_srp,
};

/// What a slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    ClassName,
    SuperclassName,
    SourceFile,
    InterfaceTable,
    MethodTable,
    FieldTable,
    InterfaceName,
    MethodName,
    MethodSignature,
    FieldName,
    FieldSignature,
}

impl SlotKind {
    /// Whether the slot points into the string section.
    pub const fn is_string(self) -> bool {
        !matches!(
            self,
            Self::InterfaceTable | Self::MethodTable | Self::FieldTable
        )
    }

    /// Whether the slot carries information irrelevant to compiled code.
    pub const fn is_debug_only(self) -> bool {
        matches!(self, Self::SourceFile)
    }
}

/// One self-relative pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset of the slot in the image.
    pub offset: usize,
    /// Resolved target, or `None` for null.
    pub target: Option<usize>,
    pub kind: SlotKind,
}

/// Inline debug bytes of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugSpan {
    /// Offset of the `debug_len` cell that describes the span.
    pub len_cell: usize,
    /// First byte of the span.
    pub start: usize,
    /// Padded length of the span.
    pub len: usize,
}

pub trait ImageVisitor {
    /// Called once per slot, in walk order. String targets have already been
    /// checked to lie inside the string section.
    fn slot(&mut self, image: &[u8], slot: &Slot) -> Result<()>;

    /// Called once per non-empty debug span, in increasing offset order.
    fn debug_span(&mut self, span: &DebugSpan) -> Result<()>;
}

struct Walker<'a, V> {
    image: &'a [u8],
    strings_start: usize,
    visitor: &'a mut V,
}

impl<V: ImageVisitor> Walker<'_, V> {
    fn visit(&mut self, offset: usize, kind: SlotKind) -> Result<Option<usize>> {
        let target = resolve_srp(self.image, offset, "slot")?;
        if let Some(t) = target {
            if kind.is_string() {
                read_string_at(self.image, t, self.strings_start, self.image.len())?;
            } else if !(HEADER_SIZE..self.strings_start).contains(&t) {
                return Err(AotError::malformed_image(format!(
                    "{kind:?} at {offset} points outside the non-string region"
                )));
            }
        } else if matches!(kind, SlotKind::ClassName) {
            return Err(AotError::malformed_image("class name is null"));
        }
        self.visitor.slot(
            self.image,
            &Slot {
                offset,
                target,
                kind,
            },
        )?;
        Ok(target)
    }

    fn required(&mut self, offset: usize, kind: SlotKind) -> Result<()> {
        if self.visit(offset, kind)?.is_none() {
            return Err(AotError::malformed_image(format!(
                "{kind:?} at {offset} is null"
            )));
        }
        Ok(())
    }
}

/// Walk `image`, reporting every slot and debug span to `visitor`.
pub fn walk<V: ImageVisitor>(image: &ClassImage, visitor: &mut V) -> Result<()> {
    let mut w = Walker {
        image: image.as_bytes(),
        strings_start: image.string_section_offset(),
        visitor,
    };

    w.visit(OFF_CLASS_NAME, SlotKind::ClassName)?;
    w.visit(OFF_SUPERCLASS, SlotKind::SuperclassName)?;
    w.visit(OFF_SOURCE_FILE, SlotKind::SourceFile)?;

    let interfaces = w.visit(OFF_INTERFACES, SlotKind::InterfaceTable)?;
    w.visit(OFF_METHODS, SlotKind::MethodTable)?;
    w.visit(OFF_FIELDS, SlotKind::FieldTable)?;

    if let Some(table) = interfaces {
        let count = image.interface_count();
        if table + 4 * count > w.strings_start {
            return Err(AotError::malformed_image(
                "interface table overruns the non-string region",
            ));
        }
        for i in 0..count {
            w.required(table + 4 * i, SlotKind::InterfaceName)?;
        }
    } else if image.interface_count() != 0 && !image.is_array() {
        return Err(AotError::malformed_image("interface table is null"));
    }

    for method in image.method_offsets()? {
        w.required(method + METHOD_OFF_NAME, SlotKind::MethodName)?;
        w.required(method + METHOD_OFF_SIGNATURE, SlotKind::MethodSignature)?;
        let code = read_usize_at(w.image, method + METHOD_OFF_BYTECODE_LEN, "bytecode_len")?;
        let debug = read_usize_at(w.image, method + METHOD_OFF_DEBUG_LEN, "debug_len")?;
        if debug > 0 {
            w.visitor.debug_span(&DebugSpan {
                len_cell: method + METHOD_OFF_DEBUG_LEN,
                start: method + METHOD_ENTRY_HEADER + pad4(code),
                len: pad4(debug),
            })?;
        }
    }

    for field in image.field_offsets()? {
        w.required(field, SlotKind::FieldName)?;
        w.required(field + 4, SlotKind::FieldSignature)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassImageBuilder;

    #[derive(Default)]
    struct Recorder {
        kinds: Vec<SlotKind>,
        strings: Vec<String>,
        spans: Vec<DebugSpan>,
    }

    impl ImageVisitor for Recorder {
        fn slot(&mut self, image: &[u8], slot: &Slot) -> Result<()> {
            self.kinds.push(slot.kind);
            if let (true, Some(t)) = (slot.kind.is_string(), slot.target) {
                let len = usize::from(u16::from_le_bytes([image[t], image[t + 1]]));
                self.strings
                    .push(String::from_utf8_lossy(&image[t + 2..t + 2 + len]).into_owned());
            }
            Ok(())
        }

        fn debug_span(&mut self, span: &DebugSpan) -> Result<()> {
            self.spans.push(*span);
            Ok(())
        }
    }

    #[test]
    fn test_walk_order() {
        let image = ClassImageBuilder::new("a/B")
            .superclass("java/lang/Object")
            .interface("a/I")
            .method("m", "()V", 0, vec![0xB1], Some(vec![9; 5]))
            .field("f", "J", 0)
            .source_file("B.java")
            .build();
        let mut rec = Recorder::default();
        walk(&image, &mut rec).unwrap();
        assert_eq!(
            rec.kinds,
            vec![
                SlotKind::ClassName,
                SlotKind::SuperclassName,
                SlotKind::SourceFile,
                SlotKind::InterfaceTable,
                SlotKind::MethodTable,
                SlotKind::FieldTable,
                SlotKind::InterfaceName,
                SlotKind::MethodName,
                SlotKind::MethodSignature,
                SlotKind::FieldName,
                SlotKind::FieldSignature,
            ]
        );
        assert_eq!(
            rec.strings,
            vec!["a/B", "java/lang/Object", "B.java", "a/I", "m", "()V", "f", "J"]
        );
        assert_eq!(rec.spans.len(), 1);
        assert_eq!(rec.spans[0].len, 8);
    }

    #[test]
    fn test_slot_kind_classification() {
        assert!(SlotKind::SourceFile.is_debug_only());
        assert!(!SlotKind::MethodName.is_debug_only());
        assert!(!SlotKind::MethodTable.is_string());
        assert!(SlotKind::InterfaceName.is_string());
    }
}
