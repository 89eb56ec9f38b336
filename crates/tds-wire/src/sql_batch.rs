//! SQL batch request encoding.
//!
//! A batch payload is the ALL_HEADERS block followed by the statement text
//! as UTF-16LE with no length prefix.

use bytes::{Bytes, BytesMut};

use crate::codec::{WireSink, utf16_byte_len};
use crate::error::ProtocolError;
use crate::headers::{RequestHeader, all_headers_len, write_all_headers};

/// A SQL batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBatch {
    sql: String,
    headers: Vec<RequestHeader>,
}

impl SqlBatch {
    /// Autocommit batch.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            headers: vec![RequestHeader::autocommit()],
        }
    }

    /// Bind the batch to a transaction descriptor.
    #[must_use]
    pub fn with_transaction(mut self, descriptor: u64, outstanding_requests: u32) -> Self {
        for header in &mut self.headers {
            if let RequestHeader::TransactionDescriptor { .. } = header {
                *header = RequestHeader::TransactionDescriptor {
                    descriptor,
                    outstanding_requests,
                };
            }
        }
        self
    }

    /// Add another header.
    #[must_use]
    pub fn with_header(mut self, header: RequestHeader) -> Self {
        self.headers.push(header);
        self
    }

    /// Statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Headers in wire order.
    #[must_use]
    pub fn headers(&self) -> &[RequestHeader] {
        &self.headers
    }

    /// Encoded payload size.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        all_headers_len(&self.headers) + utf16_byte_len(&self.sql)
    }

    /// Encode the payload.
    pub fn encode(&self, dst: &mut impl WireSink) -> Result<(), ProtocolError> {
        write_all_headers(dst, &self.headers)?;
        dst.write_utf16(&self.sql);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Split a batch payload into its transaction descriptor (if any) and text.
pub fn decode_sql_batch(payload: &[u8]) -> Result<(Option<u64>, String), ProtocolError> {
    let mut cursor = crate::cursor::ByteCursor::new(Bytes::copy_from_slice(payload));
    let total = cursor.read_u32_le()? as usize;
    let mut headers = cursor.sub_cursor(total.saturating_sub(4))?;

    let mut descriptor = None;
    while !headers.is_empty() {
        let len = headers.read_u32_le()? as usize;
        let mut header = headers.sub_cursor(len.saturating_sub(4))?;
        if header.read_u16_le()? == 0x0002 {
            descriptor = Some(header.read_u64_le()?);
        }
    }

    let chars = cursor.remaining() / 2;
    Ok((descriptor, cursor.read_utf16(chars, "sql text")?))
}
