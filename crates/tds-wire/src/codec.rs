//! Encoding helpers shared by every request writer.
//!
//! Request encoders write through [`WireSink`] rather than a concrete buffer,
//! so the same code can target a scratch `BytesMut` or stream directly into a
//! packet writer.

use bytes::BytesMut;

use crate::error::ProtocolError;

/// Destination for encoded request bytes.
///
/// Only [`write_bytes`](Self::write_bytes) is required. Multi-byte integers
/// are little-endian unless the method name says otherwise.
pub trait WireSink {
    /// Append raw bytes.
    fn write_bytes(&mut self, src: &[u8]);

    /// Append one byte.
    fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    /// Append a little-endian `u16`.
    fn write_u16_le(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a big-endian `u16`.
    fn write_u16_be(&mut self, value: u16) {
        self.write_bytes(&value.to_be_bytes());
    }

    /// Append a little-endian `u32`.
    fn write_u32_le(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a big-endian `u32`.
    fn write_u32_be(&mut self, value: u32) {
        self.write_bytes(&value.to_be_bytes());
    }

    /// Append a little-endian `u64`.
    fn write_u64_le(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a string as UTF-16LE without a length prefix.
    fn write_utf16(&mut self, s: &str) {
        for unit in s.encode_utf16() {
            self.write_u16_le(unit);
        }
    }

    /// Append a string with a one-byte character-count prefix.
    fn write_b_varchar(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
        let len = utf16_len(s);
        let prefix = u8::try_from(len).map_err(|_| ProtocolError::StringTooLong {
            field,
            len,
            max: u8::MAX as usize,
        })?;
        self.write_u8(prefix);
        self.write_utf16(s);
        Ok(())
    }

    /// Append a string with a two-byte character-count prefix.
    fn write_us_varchar(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
        let len = utf16_len(s);
        let prefix = u16::try_from(len).map_err(|_| ProtocolError::StringTooLong {
            field,
            len,
            max: u16::MAX as usize,
        })?;
        self.write_u16_le(prefix);
        self.write_utf16(s);
        Ok(())
    }
}

impl WireSink for BytesMut {
    fn write_bytes(&mut self, src: &[u8]) {
        self.extend_from_slice(src);
    }
}

/// Length of a string in UTF-16 code units.
#[must_use]
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Byte length of a string encoded as UTF-16.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    utf16_len(s) * 2
}
