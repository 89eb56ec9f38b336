//! Forward-only cursor over a message payload.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Owned read cursor over an immutable payload.
///
/// Every read checks the remaining length, advances the offset and returns a
/// `Result`; nothing else holds the offset. Slices handed out by
/// [`read_bytes`](Self::read_bytes) share the underlying allocation.
#[derive(Debug, Clone)]
pub struct ByteCursor {
    data: Bytes,
    pos: usize,
    /// Offset of `data[0]` within the outermost payload, for error reports.
    base: usize,
}

impl ByteCursor {
    /// Create a cursor positioned at the start of `data`.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            base: 0,
        }
    }

    /// Offset from the start of the outermost payload.
    #[must_use]
    pub fn position(&self) -> usize {
        self.base + self.pos
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether the cursor has consumed everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Look at the next byte without consuming it.
    #[must_use]
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::UnexpectedEof {
                offset: self.position(),
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take::<1>()?[0])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16_le(&mut self) -> Result<u16, ProtocolError> {
        self.take().map(u16::from_le_bytes)
    }

    /// Read a big-endian `u16`.
    pub fn read_u16_be(&mut self) -> Result<u16, ProtocolError> {
        self.take().map(u16::from_be_bytes)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32_le(&mut self) -> Result<u32, ProtocolError> {
        self.take().map(u32::from_le_bytes)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32_be(&mut self) -> Result<u32, ProtocolError> {
        self.take().map(u32::from_be_bytes)
    }

    /// Read a little-endian `i32`.
    pub fn read_i32_le(&mut self) -> Result<i32, ProtocolError> {
        self.take().map(i32::from_le_bytes)
    }

    /// Read a little-endian `u64`.
    pub fn read_u64_le(&mut self) -> Result<u64, ProtocolError> {
        self.take().map(u64::from_le_bytes)
    }

    /// Read `n` bytes as a shared slice.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(n)?;
        let out = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    /// Split off the next `n` bytes into their own cursor and advance past them.
    ///
    /// Used to bound length-prefixed structures: decoding inside the
    /// sub-cursor can never read into the following token.
    pub fn sub_cursor(&mut self, n: usize) -> Result<ByteCursor, ProtocolError> {
        let base = self.position();
        let data = self.read_bytes(n)?;
        Ok(ByteCursor { data, pos: 0, base })
    }

    /// Read `chars` UTF-16LE code units as a string.
    pub fn read_utf16(&mut self, chars: usize, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.read_bytes(chars * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16(field))
    }

    /// Read a string with a one-byte character-count prefix.
    pub fn read_b_varchar(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let chars = self.read_u8()? as usize;
        self.read_utf16(chars, field)
    }

    /// Read a string with a two-byte character-count prefix.
    pub fn read_us_varchar(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let chars = self.read_u16_le()? as usize;
        self.read_utf16(chars, field)
    }

    /// Read bytes with a one-byte length prefix.
    pub fn read_b_varbyte(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_endianness() {
        let mut cursor = ByteCursor::new(Bytes::from_static(&[
            0x01, 0x02, 0x01, 0x02, 0x78, 0x56, 0x34, 0x12,
        ]));
        assert_eq!(cursor.read_u16_le().unwrap(), 0x0201);
        assert_eq!(cursor.read_u16_be().unwrap(), 0x0102);
        assert_eq!(cursor.read_u32_le().unwrap(), 0x1234_5678);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let mut cursor = ByteCursor::new(Bytes::from_static(&[0xAA, 0xBB, 0xCC]));
        cursor.read_u8().unwrap();
        let err = cursor.read_u32_le().unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedEof {
                offset: 1,
                needed: 4,
                available: 2
            }
        );
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.read_u16_le().unwrap(), 0xCCBB);
    }

    #[test]
    fn test_varchar_lengths_are_in_characters() {
        // "hi" as B_VARCHAR then "ok" as US_VARCHAR
        let mut cursor = ByteCursor::new(Bytes::from_static(&[
            0x02, b'h', 0, b'i', 0, 0x02, 0x00, b'o', 0, b'k', 0,
        ]));
        assert_eq!(cursor.read_b_varchar("name").unwrap(), "hi");
        assert_eq!(cursor.read_us_varchar("name").unwrap(), "ok");
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_sub_cursor_is_bounded() {
        let mut cursor = ByteCursor::new(Bytes::from_static(&[1, 2, 3, 4, 5]));
        cursor.skip(1).unwrap();
        let mut inner = cursor.sub_cursor(2).unwrap();
        assert_eq!(inner.position(), 1);
        assert_eq!(inner.read_u8().unwrap(), 2);
        assert_eq!(inner.read_u8().unwrap(), 3);
        assert!(inner.read_u8().is_err());
        assert_eq!(cursor.read_u8().unwrap(), 4);
    }

    #[test]
    fn test_invalid_utf16() {
        // lone high surrogate
        let mut cursor = ByteCursor::new(Bytes::from_static(&[0x01, 0x00, 0xD8]));
        assert_eq!(
            cursor.read_b_varchar("server").unwrap_err(),
            ProtocolError::InvalidUtf16("server")
        );
    }
}
