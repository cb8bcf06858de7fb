//! Class image construction.
//!
//! The builder can lay out the same class in several physically different
//! ways (shared or duplicated strings, different string order, with or
//! without debug information), which is exactly the load-time variation the
//! canonicalizer has to erase.

use crate::layout::{
    ClassFlags, ClassImage, FIELD_ENTRY_SIZE, HEADER_SIZE, METHOD_ENTRY_HEADER,
    METHOD_OFF_BYTECODE_LEN, METHOD_OFF_DEBUG_LEN, METHOD_OFF_MODIFIERS, METHOD_OFF_NAME,
    METHOD_OFF_SIGNATURE, OFF_CLASS_NAME, OFF_FIELD_COUNT, OFF_FIELDS, OFF_FLAGS,
    OFF_IMAGE_SIZE, OFF_INTERFACE_COUNT, OFF_INTERFACES, OFF_METHOD_COUNT, OFF_METHODS,
    OFF_SOURCE_FILE, OFF_STRING_SECTION, OFF_SUPERCLASS, ARRAY_INTERFACES, pad4,
    string_entry_size, write_srp, write_u32_at,
};

/// Order in which the string section is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringOrder {
    /// Strings appear in the order their slots are walked.
    #[default]
    FirstUse,
    /// Strings appear in reverse walk order.
    Reversed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MethodSpec {
    name: String,
    signature: String,
    modifiers: u32,
    bytecode: Vec<u8>,
    debug: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSpec {
    name: String,
    signature: String,
    modifiers: u32,
}

/// Builds [`ClassImage`]s.
#[derive(Debug, Clone)]
pub struct ClassImageBuilder {
    name: String,
    flags: ClassFlags,
    superclass: Option<String>,
    interfaces: Vec<String>,
    methods: Vec<MethodSpec>,
    fields: Vec<FieldSpec>,
    source_file: Option<String>,
    share_strings: bool,
    order: StringOrder,
    include_debug: bool,
}

impl ClassImageBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: ClassFlags::empty(),
            superclass: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            source_file: None,
            share_strings: true,
            order: StringOrder::FirstUse,
            include_debug: true,
        }
    }

    /// An array class: no owned tables, superclass `java/lang/Object`.
    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name)
            .flags(ClassFlags::ARRAY | ClassFlags::FINAL)
            .superclass("java/lang/Object")
    }

    #[must_use]
    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn superclass(mut self, name: impl Into<String>) -> Self {
        self.superclass = Some(name.into());
        self
    }

    #[must_use]
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    #[must_use]
    pub fn method(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        modifiers: u32,
        bytecode: Vec<u8>,
        debug: Option<Vec<u8>>,
    ) -> Self {
        self.methods.push(MethodSpec {
            name: name.into(),
            signature: signature.into(),
            modifiers,
            bytecode,
            debug,
        });
        self
    }

    #[must_use]
    pub fn field(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        modifiers: u32,
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            signature: signature.into(),
            modifiers,
        });
        self
    }

    #[must_use]
    pub fn source_file(mut self, name: impl Into<String>) -> Self {
        self.source_file = Some(name.into());
        self
    }

    /// Whether equal strings share one entry (`true`) or each slot gets its
    /// own copy.
    #[must_use]
    pub fn share_strings(mut self, share: bool) -> Self {
        self.share_strings = share;
        self
    }

    #[must_use]
    pub fn string_order(mut self, order: StringOrder) -> Self {
        self.order = order;
        self
    }

    /// Whether debug spans and the source-file slot are emitted.
    #[must_use]
    pub fn include_debug(mut self, include: bool) -> Self {
        self.include_debug = include;
        self
    }

    fn is_array(&self) -> bool {
        self.flags.contains(ClassFlags::ARRAY)
    }

    /// Lay the class out.
    ///
    /// # Panics
    ///
    /// Panics if a string is longer than `u16::MAX` bytes or the image grows
    /// beyond `u32::MAX` bytes.
    pub fn build(&self) -> ClassImage {
        let array = self.is_array();
        let interfaces: &[String] = if array { &[] } else { &self.interfaces };

        let iface_table = HEADER_SIZE;
        let methods_start = iface_table + 4 * interfaces.len();
        let mut method_offsets = Vec::with_capacity(self.methods.len());
        let mut cursor = methods_start;
        for m in &self.methods {
            method_offsets.push(cursor);
            cursor += METHOD_ENTRY_HEADER + pad4(m.bytecode.len()) + pad4(self.debug_len(m));
        }
        let fields_start = cursor;
        let strings_start = fields_start + FIELD_ENTRY_SIZE * self.fields.len();

        // String slots in walk order.
        let mut slots: Vec<(usize, &str)> = vec![(OFF_CLASS_NAME, self.name.as_str())];
        if let Some(sup) = &self.superclass {
            slots.push((OFF_SUPERCLASS, sup.as_str()));
        }
        if let (true, Some(src)) = (self.include_debug, &self.source_file) {
            slots.push((OFF_SOURCE_FILE, src.as_str()));
        }
        for (i, iface) in interfaces.iter().enumerate() {
            slots.push((iface_table + 4 * i, iface.as_str()));
        }
        for (m, off) in self.methods.iter().zip(&method_offsets) {
            slots.push((off + METHOD_OFF_NAME, m.name.as_str()));
            slots.push((off + METHOD_OFF_SIGNATURE, m.signature.as_str()));
        }
        for (i, f) in self.fields.iter().enumerate() {
            let off = fields_start + FIELD_ENTRY_SIZE * i;
            slots.push((off, f.name.as_str()));
            slots.push((off + 4, f.signature.as_str()));
        }

        // Decide which string entry each slot uses.
        let mut entries: Vec<&str> = Vec::new();
        let mut slot_entry = Vec::with_capacity(slots.len());
        for &(_, s) in &slots {
            let existing = if self.share_strings {
                entries.iter().position(|e| *e == s)
            } else {
                None
            };
            slot_entry.push(existing.unwrap_or_else(|| {
                entries.push(s);
                entries.len() - 1
            }));
        }
        let placement: Vec<usize> = match self.order {
            StringOrder::FirstUse => (0..entries.len()).collect(),
            StringOrder::Reversed => (0..entries.len()).rev().collect(),
        };
        let mut entry_offset = vec![0_usize; entries.len()];
        let mut cursor = strings_start;
        for &e in &placement {
            entry_offset[e] = cursor;
            cursor += string_entry_size(entries[e].len());
        }
        let total = cursor;

        let mut bytes = vec![0_u8; total];
        for (e, entry) in entries.iter().enumerate() {
            let off = entry_offset[e];
            let s = entry.as_bytes();
            let len = u16::try_from(s.len()).expect("class image string exceeds u16");
            bytes[off..off + 2].copy_from_slice(&len.to_le_bytes());
            bytes[off + 2..off + 2 + s.len()].copy_from_slice(s);
        }

        let u32_of = |v: usize| u32::try_from(v).expect("class image exceeds u32");
        write_u32_at(&mut bytes, OFF_IMAGE_SIZE, u32_of(total));
        write_u32_at(&mut bytes, OFF_FLAGS, self.flags.bits());
        write_u32_at(&mut bytes, OFF_STRING_SECTION, u32_of(strings_start));
        let iface_count = if array {
            ARRAY_INTERFACES.len()
        } else {
            interfaces.len()
        };
        write_u32_at(&mut bytes, OFF_INTERFACE_COUNT, u32_of(iface_count));
        write_u32_at(&mut bytes, OFF_METHOD_COUNT, u32_of(self.methods.len()));
        write_u32_at(&mut bytes, OFF_FIELD_COUNT, u32_of(self.fields.len()));
        let table = |present: bool, at: usize| present.then_some(at);
        let srp = |bytes: &mut Vec<u8>, slot: usize, target: Option<usize>| {
            write_srp(bytes, slot, target).expect("builder offsets fit in i32");
        };
        srp(&mut bytes, OFF_INTERFACES, table(!interfaces.is_empty(), iface_table));
        srp(&mut bytes, OFF_METHODS, table(!self.methods.is_empty(), methods_start));
        srp(&mut bytes, OFF_FIELDS, table(!self.fields.is_empty(), fields_start));

        for (m, &off) in self.methods.iter().zip(&method_offsets) {
            write_u32_at(&mut bytes, off + METHOD_OFF_MODIFIERS, m.modifiers);
            write_u32_at(&mut bytes, off + METHOD_OFF_BYTECODE_LEN, u32_of(m.bytecode.len()));
            let debug_len = self.debug_len(m);
            write_u32_at(&mut bytes, off + METHOD_OFF_DEBUG_LEN, u32_of(debug_len));
            let code_at = off + METHOD_ENTRY_HEADER;
            bytes[code_at..code_at + m.bytecode.len()].copy_from_slice(&m.bytecode);
            if debug_len > 0 {
                if let Some(debug) = &m.debug {
                    let at = code_at + pad4(m.bytecode.len());
                    bytes[at..at + debug.len()].copy_from_slice(debug);
                }
            }
        }
        for (i, f) in self.fields.iter().enumerate() {
            let off = fields_start + FIELD_ENTRY_SIZE * i;
            write_u32_at(&mut bytes, off + 8, f.modifiers);
        }
        for ((slot, _), e) in slots.iter().zip(&slot_entry) {
            srp(&mut bytes, *slot, Some(entry_offset[*e]));
        }

        ClassImage::from_trusted(bytes)
    }

    fn debug_len(&self, m: &MethodSpec) -> usize {
        match (&m.debug, self.include_debug) {
            (Some(d), true) => d.len(),
            _ => 0,
        }
    }
}
