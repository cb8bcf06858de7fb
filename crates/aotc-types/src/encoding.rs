//! Little-endian encoding helpers shared by the record and snapshot codecs.
//!
//! Writers append to a `Vec<u8>`; [`ByteReader`] performs bounds-checked reads
//! and reports every violation as [`AotError::MalformedRecord`] tagged with
//! the reader's context string.

use aotc_error::{AotError, Result};

#[inline]
pub fn append_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u32` length prefix followed by `bytes`.
///
/// # Panics
///
/// Panics if `bytes` is longer than `u32::MAX`; callers bound their inputs
/// well below that.
pub fn append_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).expect("length-prefixed field exceeds u32");
    append_u32_le(buf, len);
    buf.extend_from_slice(bytes);
}

/// Encoded size of a length-prefixed field.
#[inline]
pub const fn len_prefixed_size(len: usize) -> usize {
    4 + len
}

/// Overwrite a `u32` at `offset`.
#[inline]
pub fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite a `u64` at `offset`.
#[inline]
pub fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a `u32` at `offset`, or `None` when out of bounds.
#[inline]
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let raw = buf.get(offset..end)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

/// Read a `u64` at `offset`, or `None` when out of bounds.
#[inline]
pub fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    let raw = buf.get(offset..end)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

// ---------------------------------------------------------------------------
// ByteReader
// ---------------------------------------------------------------------------

/// Sequential bounds-checked reader.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8], context: &'static str) -> Self {
        Self {
            bytes,
            pos: 0,
            context,
        }
    }

    #[inline]
    pub const fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn error(&self, detail: impl std::fmt::Display) -> AotError {
        AotError::malformed_record(format!("{}: {detail} at byte {}", self.context, self.pos))
    }

    /// Borrow the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| self.error("length overflow"))?;
        if end > self.bytes.len() {
            return Err(self.error(format_args!(
                "need {len} bytes, only {} remain",
                self.remaining()
            )));
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let raw = self.read_bytes(N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a `u32` count and convert it to `usize`, rejecting counts that
    /// could not possibly fit in the remaining input at `min_item_size`
    /// bytes per item.
    pub fn read_count(&mut self, min_item_size: usize) -> Result<usize> {
        let raw = self.read_u32()?;
        let count = usize::try_from(raw).map_err(|_| self.error("count exceeds usize"))?;
        let needed = count
            .checked_mul(min_item_size)
            .ok_or_else(|| self.error("count overflow"))?;
        if needed > self.remaining() {
            return Err(self.error(format_args!(
                "count {count} needs {needed} bytes, only {} remain",
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Read a `u32` length prefix and the bytes that follow.
    pub fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_count(1)?;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_len_prefixed()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|err| self.error(format_args!("invalid UTF-8: {err}")))
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.error(format_args!("{} trailing bytes", self.remaining())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sequential_reads() {
        let mut buf = Vec::new();
        append_u8(&mut buf, 7);
        append_u32_le(&mut buf, 0xDEAD_BEEF);
        append_u64_le(&mut buf, 42);
        append_len_prefixed(&mut buf, b"java/lang/Object");

        let mut r = ByteReader::new(&buf, "test");
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert_eq!(r.read_string().unwrap(), "java/lang/Object");
        r.finish().unwrap();
    }

    #[test]
    fn test_reader_rejects_short_input() {
        let buf = [1_u8, 2, 3];
        let mut r = ByteReader::new(&buf, "short");
        let err = r.read_u32().unwrap_err();
        assert!(err.to_string().contains("short"));
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_reader_rejects_absurd_counts() {
        let mut buf = Vec::new();
        append_u32_le(&mut buf, 1_000_000);
        let mut r = ByteReader::new(&buf, "count");
        assert!(r.read_count(8).is_err());
    }

    #[test]
    fn test_reader_reports_trailing_bytes() {
        let buf = [0_u8; 5];
        let mut r = ByteReader::new(&buf, "trailing");
        r.read_u32().unwrap();
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_fixed_offset_helpers() {
        let mut buf = vec![0_u8; 16];
        write_u32_le(&mut buf, 2, 99);
        write_u64_le(&mut buf, 8, u64::MAX);
        assert_eq!(read_u32_le(&buf, 2), Some(99));
        assert_eq!(read_u64_le(&buf, 8), Some(u64::MAX));
        assert_eq!(read_u64_le(&buf, 9), None);
    }
}
