//! ALL_HEADERS request prefix.
//!
//! SQL batch and RPC requests start with a block of typed headers:
//! `u32` total length, then per header `u32` length (including itself),
//! `u16` type and a type-specific body. All integers are little-endian.

use crate::codec::{WireSink, utf16_byte_len};
use crate::error::ProtocolError;

/// One entry of the ALL_HEADERS block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestHeader {
    /// Ask the server to send a query notification.
    QueryNotification {
        /// Notification id.
        notify_id: String,
        /// Service broker deployment.
        ssb_deployment: String,
        /// Subscription timeout in seconds.
        timeout: Option<u32>,
    },
    /// Bind the request to a transaction.
    TransactionDescriptor {
        /// Descriptor from the last transaction environment change, 0 for autocommit.
        descriptor: u64,
        /// Requests outstanding on this connection, including this one.
        outstanding_requests: u32,
    },
    /// Client activity id for tracing.
    TraceActivity {
        /// Activity GUID.
        activity_id: [u8; 16],
        /// Sequence number within the activity.
        sequence: u32,
    },
}

impl RequestHeader {
    /// Autocommit transaction header for a single outstanding request.
    #[must_use]
    pub const fn autocommit() -> Self {
        Self::TransactionDescriptor {
            descriptor: 0,
            outstanding_requests: 1,
        }
    }

    /// Header type code.
    #[must_use]
    pub const fn type_code(&self) -> u16 {
        match self {
            Self::QueryNotification { .. } => 0x0001,
            Self::TransactionDescriptor { .. } => 0x0002,
            Self::TraceActivity { .. } => 0x0003,
        }
    }

    /// Encoded length including the 6-byte length/type prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        6 + match self {
            Self::QueryNotification {
                notify_id,
                ssb_deployment,
                timeout,
            } => {
                2 + utf16_byte_len(notify_id)
                    + 2
                    + utf16_byte_len(ssb_deployment)
                    + timeout.map_or(0, |_| 4)
            }
            Self::TransactionDescriptor { .. } => 12,
            Self::TraceActivity { .. } => 20,
        }
    }

    /// Encode this header.
    pub fn encode(&self, dst: &mut impl WireSink) -> Result<(), ProtocolError> {
        dst.write_u32_le(self.encoded_len() as u32);
        dst.write_u16_le(self.type_code());
        match self {
            Self::QueryNotification {
                notify_id,
                ssb_deployment,
                timeout,
            } => {
                write_us_bytevarchar(dst, "notify id", notify_id)?;
                write_us_bytevarchar(dst, "ssb deployment", ssb_deployment)?;
                if let Some(timeout) = timeout {
                    dst.write_u32_le(*timeout);
                }
            }
            Self::TransactionDescriptor {
                descriptor,
                outstanding_requests,
            } => {
                dst.write_u64_le(*descriptor);
                dst.write_u32_le(*outstanding_requests);
            }
            Self::TraceActivity {
                activity_id,
                sequence,
            } => {
                dst.write_bytes(activity_id);
                dst.write_u32_le(*sequence);
            }
        }
        Ok(())
    }
}

/// Strings in query notification headers carry a byte count, not a character count.
fn write_us_bytevarchar(
    dst: &mut impl WireSink,
    field: &'static str,
    value: &str,
) -> Result<(), ProtocolError> {
    let len = utf16_byte_len(value);
    let prefix = u16::try_from(len).map_err(|_| ProtocolError::StringTooLong {
        field,
        len: len / 2,
        max: u16::MAX as usize / 2,
    })?;
    dst.write_u16_le(prefix);
    dst.write_utf16(value);
    Ok(())
}

/// Total size of an ALL_HEADERS block.
#[must_use]
pub fn all_headers_len(headers: &[RequestHeader]) -> usize {
    4 + headers.iter().map(RequestHeader::encoded_len).sum::<usize>()
}

/// Write the ALL_HEADERS block.
pub fn write_all_headers(
    dst: &mut impl WireSink,
    headers: &[RequestHeader],
) -> Result<(), ProtocolError> {
    dst.write_u32_le(all_headers_len(headers) as u32);
    for header in headers {
        header.encode(dst)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_transaction_descriptor_layout() {
        let mut buf = BytesMut::new();
        write_all_headers(
            &mut buf,
            &[RequestHeader::TransactionDescriptor {
                descriptor: 0x0102_0304_0506_0708,
                outstanding_requests: 1,
            }],
        )
        .unwrap();

        assert_eq!(buf.len(), 22);
        assert_eq!(&buf[0..4], &[22, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[18, 0, 0, 0]);
        assert_eq!(&buf[8..10], &[0x02, 0x00]);
        assert_eq!(&buf[10..18], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&buf[18..22], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_mixed_headers_lengths_agree() {
        let headers = [
            RequestHeader::QueryNotification {
                notify_id: "n1".into(),
                ssb_deployment: "svc".into(),
                timeout: Some(60),
            },
            RequestHeader::autocommit(),
            RequestHeader::TraceActivity {
                activity_id: [0xAB; 16],
                sequence: 7,
            },
        ];
        let mut buf = BytesMut::new();
        write_all_headers(&mut buf, &headers).unwrap();

        assert_eq!(buf.len(), all_headers_len(&headers));
        // notification header: 6 + (2 + 4) + (2 + 6) + 4
        assert_eq!(headers[0].encoded_len(), 24);
        assert_eq!(&buf[4..10], &[24, 0, 0, 0, 0x01, 0x00]);
        assert_eq!(headers[2].encoded_len(), 26);
    }
}
