//! In-memory class image layout.
//!
//! A class image is one contiguous little-endian blob in which every internal
//! reference is a self-relative pointer (SRP): a signed 32-bit displacement
//! from the slot's own offset, with 0 meaning null.
//!
//! ```text
//! offset  field
//! 0       image_size            u32
//! 4       flags                 u32   (ClassFlags)
//! 8       class_name            srp -> string
//! 12      superclass_name       srp -> string | null
//! 16      interface_count       u32
//! 20      interfaces            srp -> [srp -> string; interface_count] | null
//! 24      method_count          u32
//! 28      methods               srp -> first method entry | null
//! 32      field_count           u32
//! 36      fields                srp -> first field entry | null
//! 40      source_file           srp -> string | null   (debug only)
//! 44      string_section_offset u32
//! ```
//!
//! Method entries are `name:srp sig:srp modifiers:u32 bytecode_len:u32
//! debug_len:u32` followed by the bytecodes and then the inline debug bytes,
//! each padded to 4. Field entries are `name:srp sig:srp modifiers:u32`.
//! Everything from `string_section_offset` to `image_size` is the string
//! section: `len:u16` plus UTF-8 bytes, padded to an even length.
//!
//! Array classes do not own their interface table: `interfaces` is null and
//! the interface set is the fixed [`ARRAY_INTERFACES`].

use aotc_error::{AotError, Result};

use crate::walk::{DebugSpan, ImageVisitor, Slot, walk};

pub const HEADER_SIZE: usize = 48;
pub const METHOD_ENTRY_HEADER: usize = 20;
pub const FIELD_ENTRY_SIZE: usize = 12;

pub const OFF_IMAGE_SIZE: usize = 0;
pub const OFF_FLAGS: usize = 4;
pub const OFF_CLASS_NAME: usize = 8;
pub const OFF_SUPERCLASS: usize = 12;
pub const OFF_INTERFACE_COUNT: usize = 16;
pub const OFF_INTERFACES: usize = 20;
pub const OFF_METHOD_COUNT: usize = 24;
pub const OFF_METHODS: usize = 28;
pub const OFF_FIELD_COUNT: usize = 32;
pub const OFF_FIELDS: usize = 36;
pub const OFF_SOURCE_FILE: usize = 40;
pub const OFF_STRING_SECTION: usize = 44;

/// Offsets within a method entry.
pub const METHOD_OFF_NAME: usize = 0;
pub const METHOD_OFF_SIGNATURE: usize = 4;
pub const METHOD_OFF_MODIFIERS: usize = 8;
pub const METHOD_OFF_BYTECODE_LEN: usize = 12;
pub const METHOD_OFF_DEBUG_LEN: usize = 16;

/// Interfaces every array class implements.
pub const ARRAY_INTERFACES: [&str; 2] = ["java/lang/Cloneable", "java/io/Serializable"];

bitflags::bitflags! {
    /// Class-level flags stored at offset 4.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u32 {
        const INTERFACE = 0x0001;
        const ABSTRACT = 0x0002;
        const FINAL = 0x0004;
        /// Array class; its interface table is shared, not owned.
        const ARRAY = 0x0100;
        /// Runtime-generated hidden class.
        const HIDDEN = 0x0200;
    }
}

#[inline]
pub(crate) const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[inline]
pub(crate) const fn pad2(len: usize) -> usize {
    (len + 1) & !1
}

/// Encoded size of a string-section entry.
#[inline]
pub(crate) const fn string_entry_size(len: usize) -> usize {
    pad2(2 + len)
}

pub(crate) fn read_u32_at(bytes: &[u8], offset: usize, field: &str) -> Result<u32> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| AotError::malformed_image(format!("{field} offset overflow")))?;
    if end > bytes.len() {
        return Err(AotError::malformed_image(format!(
            "{field} out of bounds: end={end}, len={}",
            bytes.len()
        )));
    }
    Ok(u32::from_le_bytes(
        bytes[offset..end].try_into().expect("fixed 4-byte field"),
    ))
}

pub(crate) fn read_usize_at(bytes: &[u8], offset: usize, field: &str) -> Result<usize> {
    let value = read_u32_at(bytes, offset, field)?;
    usize::try_from(value).map_err(|_| AotError::OutOfRange {
        what: field.to_owned(),
        value: value.to_string(),
    })
}

pub(crate) fn write_u32_at(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Resolve the SRP stored at `slot`, returning `None` for null.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn resolve_srp(bytes: &[u8], slot: usize, field: &str) -> Result<Option<usize>> {
    let raw = read_u32_at(bytes, slot, field)? as i32;
    if raw == 0 {
        return Ok(None);
    }
    let target = i64::try_from(slot).unwrap_or(i64::MAX) + i64::from(raw);
    match usize::try_from(target) {
        Ok(t) if t < bytes.len() => Ok(Some(t)),
        _ => Err(AotError::malformed_image(format!(
            "{field} at {slot} points outside the image ({target})"
        ))),
    }
}

/// Encode an SRP from `slot` to `target`.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn write_srp(bytes: &mut [u8], slot: usize, target: Option<usize>) -> Result<()> {
    let value = match target {
        None => 0,
        Some(t) => {
            let delta = i64::try_from(t).unwrap_or(i64::MAX) - i64::try_from(slot).unwrap_or(0);
            i32::try_from(delta).map_err(|_| AotError::OutOfRange {
                what: "self-relative pointer".to_owned(),
                value: delta.to_string(),
            })?
        }
    };
    write_u32_at(bytes, slot, value as u32);
    Ok(())
}

/// Read the string entry at `offset`, which must lie in
/// `[section_start, section_end)`.
pub(crate) fn read_string_at(
    bytes: &[u8],
    offset: usize,
    section_start: usize,
    section_end: usize,
) -> Result<&str> {
    if offset < section_start || offset + 2 > section_end {
        return Err(AotError::malformed_image(format!(
            "string at {offset} is outside the string section [{section_start}, {section_end})"
        )));
    }
    let len = usize::from(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]));
    let end = offset + 2 + len;
    if end > section_end {
        return Err(AotError::malformed_image(format!(
            "string at {offset} overruns the string section"
        )));
    }
    std::str::from_utf8(&bytes[offset + 2..end])
        .map_err(|err| AotError::malformed_image(format!("string at {offset}: {err}")))
}

// ---------------------------------------------------------------------------
// ClassImage
// ---------------------------------------------------------------------------

/// A validated class image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassImage {
    bytes: Vec<u8>,
}

/// Borrowed view of one method entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodView<'a> {
    pub name: &'a str,
    pub signature: &'a str,
    pub modifiers: u32,
    pub bytecode: &'a [u8],
}

/// The walker itself checks every slot and span; validation needs no state.
struct Validator;

impl ImageVisitor for Validator {
    fn slot(&mut self, _image: &[u8], _slot: &Slot) -> Result<()> {
        Ok(())
    }

    fn debug_span(&mut self, _span: &DebugSpan) -> Result<()> {
        Ok(())
    }
}

impl ClassImage {
    /// Validate `bytes` as a class image.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(AotError::malformed_image(format!(
                "image of {} bytes is smaller than the {HEADER_SIZE}-byte header",
                bytes.len()
            )));
        }
        let declared = read_usize_at(&bytes, OFF_IMAGE_SIZE, "image_size")?;
        if declared != bytes.len() {
            return Err(AotError::malformed_image(format!(
                "image_size {declared} does not match {} bytes",
                bytes.len()
            )));
        }
        let strings = read_usize_at(&bytes, OFF_STRING_SECTION, "string_section_offset")?;
        if !(HEADER_SIZE..=bytes.len()).contains(&strings) {
            return Err(AotError::malformed_image(format!(
                "string section offset {strings} outside [{HEADER_SIZE}, {}]",
                bytes.len()
            )));
        }
        let flags_raw = read_u32_at(&bytes, OFF_FLAGS, "flags")?;
        let flags = ClassFlags::from_bits(flags_raw)
            .ok_or_else(|| AotError::malformed_image(format!("unknown flags {flags_raw:#x}")))?;
        if resolve_srp(&bytes, OFF_CLASS_NAME, "class_name")?.is_none() {
            return Err(AotError::malformed_image("class name is null"));
        }
        if flags.contains(ClassFlags::ARRAY) {
            let owned_tables = resolve_srp(&bytes, OFF_INTERFACES, "interfaces")?.is_some()
                || read_u32_at(&bytes, OFF_METHOD_COUNT, "method_count")? != 0
                || read_u32_at(&bytes, OFF_FIELD_COUNT, "field_count")? != 0;
            if owned_tables {
                return Err(AotError::malformed_image(
                    "array class must not own interface, method or field tables",
                ));
            }
        }
        let image = Self { bytes };
        walk(&image, &mut Validator)?;
        Ok(image)
    }

    /// Wrap bytes produced by this crate's own writers.
    pub(crate) fn from_trusted(bytes: Vec<u8>) -> Self {
        debug_assert!(Self::parse(bytes.clone()).is_ok());
        Self { bytes }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
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

    pub fn flags(&self) -> ClassFlags {
        ClassFlags::from_bits_truncate(self.header_u32(OFF_FLAGS))
    }

    pub fn is_array(&self) -> bool {
        self.flags().contains(ClassFlags::ARRAY)
    }

    /// Offset of the first byte of the string section.
    pub fn string_section_offset(&self) -> usize {
        self.header_u32(OFF_STRING_SECTION) as usize
    }

    pub fn interface_count(&self) -> usize {
        self.header_u32(OFF_INTERFACE_COUNT) as usize
    }

    pub fn method_count(&self) -> usize {
        self.header_u32(OFF_METHOD_COUNT) as usize
    }

    pub fn field_count(&self) -> usize {
        self.header_u32(OFF_FIELD_COUNT) as usize
    }

    fn header_u32(&self, offset: usize) -> u32 {
        // The header was bounds-checked in `parse`.
        read_u32_at(&self.bytes, offset, "header").unwrap_or(0)
    }

    /// Follow the string SRP at `slot`.
    pub(crate) fn string_slot(&self, slot: usize) -> Result<Option<&str>> {
        match resolve_srp(&self.bytes, slot, "string slot")? {
            None => Ok(None),
            Some(target) => read_string_at(
                &self.bytes,
                target,
                self.string_section_offset(),
                self.bytes.len(),
            )
            .map(Some),
        }
    }

    pub fn name(&self) -> Result<&str> {
        self.string_slot(OFF_CLASS_NAME)?
            .ok_or_else(|| AotError::malformed_image("class name is null"))
    }

    pub fn superclass_name(&self) -> Result<Option<&str>> {
        self.string_slot(OFF_SUPERCLASS)
    }

    pub fn source_file(&self) -> Result<Option<&str>> {
        self.string_slot(OFF_SOURCE_FILE)
    }

    /// Names of the directly implemented interfaces, in table order.
    pub fn interface_names(&self) -> Result<Vec<&str>> {
        if self.is_array() {
            return Ok(ARRAY_INTERFACES.to_vec());
        }
        let Some(table) = resolve_srp(&self.bytes, OFF_INTERFACES, "interfaces")? else {
            return Ok(Vec::new());
        };
        (0..self.interface_count())
            .map(|i| {
                self.string_slot(table + 4 * i)?
                    .ok_or_else(|| AotError::malformed_image(format!("interface {i} is null")))
            })
            .collect()
    }

    /// Offsets of each method entry.
    pub(crate) fn method_offsets(&self) -> Result<Vec<usize>> {
        let count = self.method_count();
        let Some(mut offset) = resolve_srp(&self.bytes, OFF_METHODS, "methods")? else {
            if count == 0 {
                return Ok(Vec::new());
            }
            return Err(AotError::malformed_image("methods table is null"));
        };
        let limit = self.string_section_offset();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            if offset + METHOD_ENTRY_HEADER > limit {
                return Err(AotError::malformed_image(format!(
                    "method {i} header overruns the non-string region"
                )));
            }
            let code = read_usize_at(&self.bytes, offset + METHOD_OFF_BYTECODE_LEN, "bytecode_len")?;
            let debug = read_usize_at(&self.bytes, offset + METHOD_OFF_DEBUG_LEN, "debug_len")?;
            let size = METHOD_ENTRY_HEADER + pad4(code) + pad4(debug);
            if offset + size > limit {
                return Err(AotError::malformed_image(format!(
                    "method {i} body overruns the non-string region"
                )));
            }
            out.push(offset);
            offset += size;
        }
        Ok(out)
    }

    /// Offsets of each field entry.
    pub(crate) fn field_offsets(&self) -> Result<Vec<usize>> {
        let count = self.field_count();
        let Some(start) = resolve_srp(&self.bytes, OFF_FIELDS, "fields")? else {
            if count == 0 {
                return Ok(Vec::new());
            }
            return Err(AotError::malformed_image("fields table is null"));
        };
        if start + count * FIELD_ENTRY_SIZE > self.string_section_offset() {
            return Err(AotError::malformed_image(
                "fields table overruns the non-string region",
            ));
        }
        Ok((0..count).map(|i| start + i * FIELD_ENTRY_SIZE).collect())
    }

    /// Borrowed views of every method, in table order.
    pub fn methods(&self) -> Result<Vec<MethodView<'_>>> {
        self.method_offsets()?
            .into_iter()
            .map(|m| {
                let code = read_usize_at(&self.bytes, m + METHOD_OFF_BYTECODE_LEN, "bytecode_len")?;
                let start = m + METHOD_ENTRY_HEADER;
                Ok(MethodView {
                    name: self
                        .string_slot(m + METHOD_OFF_NAME)?
                        .ok_or_else(|| AotError::malformed_image("method name is null"))?,
                    signature: self
                        .string_slot(m + METHOD_OFF_SIGNATURE)?
                        .ok_or_else(|| AotError::malformed_image("method signature is null"))?,
                    modifiers: read_u32_at(&self.bytes, m + METHOD_OFF_MODIFIERS, "modifiers")?,
                    bytecode: &self.bytes[start..start + code],
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassImageBuilder;

    fn sample() -> ClassImage {
        ClassImageBuilder::new("app/Widget")
            .superclass("java/lang/Object")
            .interface("java/lang/Runnable")
            .method("run", "()V", 1, vec![0xB1], Some(vec![1, 2, 3]))
            .method("size", "()I", 1, vec![0x03, 0xAC], None)
            .field("count", "I", 2)
            .source_file("Widget.java")
            .build()
    }

    #[test]
    fn test_accessors() {
        let image = sample();
        assert_eq!(image.name().unwrap(), "app/Widget");
        assert_eq!(image.superclass_name().unwrap(), Some("java/lang/Object"));
        assert_eq!(image.interface_names().unwrap(), vec!["java/lang/Runnable"]);
        assert_eq!(image.source_file().unwrap(), Some("Widget.java"));
        let methods = image.methods().unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[1].name, "size");
        assert_eq!(methods[1].bytecode, &[0x03, 0xAC]);
        assert_eq!(image.field_count(), 1);
    }

    #[test]
    fn test_parse_accepts_built_image() {
        let image = sample();
        let reparsed = ClassImage::parse(image.as_bytes().to_vec()).unwrap();
        assert_eq!(reparsed, image);
    }

    #[test]
    fn test_parse_rejects_size_mismatch() {
        let mut bytes = sample().into_bytes();
        bytes.push(0);
        assert!(matches!(
            ClassImage::parse(bytes),
            Err(AotError::MalformedClassImage { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_wild_pointer() {
        let mut bytes = sample().into_bytes();
        write_u32_at(&mut bytes, OFF_SUPERCLASS, 0x7FFF_0000);
        assert!(ClassImage::parse(bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_string_slot_into_code() {
        let mut bytes = sample().into_bytes();
        // Point the class name at the header itself.
        #[allow(clippy::cast_sign_loss)]
        write_u32_at(&mut bytes, OFF_CLASS_NAME, -8_i32 as u32);
        assert!(ClassImage::parse(bytes).is_err());
    }

    #[test]
    fn test_array_class_uses_fixed_interfaces() {
        let image = ClassImageBuilder::array("[Lapp/Widget;").build();
        assert!(image.is_array());
        assert_eq!(image.interface_names().unwrap(), ARRAY_INTERFACES.to_vec());
        assert!(image.methods().unwrap().is_empty());
    }

    #[test]
    fn test_srp_encoding() {
        let mut buf = vec![0_u8; 32];
        write_srp(&mut buf, 8, Some(4)).unwrap();
        assert_eq!(resolve_srp(&buf, 8, "x").unwrap(), Some(4));
        write_srp(&mut buf, 8, None).unwrap();
        assert_eq!(resolve_srp(&buf, 8, "x").unwrap(), None);
    }
}
