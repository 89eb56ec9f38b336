//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while encoding or decoding wire structures.
///
/// Every variant describes malformed or unexpected bytes. Callers that own a
/// connection treat all of them as fatal for that connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes to decode a packet header or fixed structure.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The cursor ran past the end of its buffer.
    #[error("unexpected end of data at offset {offset}: needed {needed} bytes, {available} available")]
    UnexpectedEof {
        /// Cursor offset where the read started.
        offset: usize,
        /// Bytes requested.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Packet status byte carries undefined bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Declared packet length is outside the accepted range.
    #[error("invalid packet length {length} (allowed {min}..={max})")]
    InvalidPacketLength {
        /// Declared length.
        length: usize,
        /// Minimum accepted length.
        min: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A token tag the decoder does not handle.
    #[error("unknown token 0x{tag:02X} at offset {offset}")]
    UnknownToken {
        /// Tag byte.
        tag: u8,
        /// Offset of the tag within the message payload.
        offset: usize,
    },

    /// A length-prefixed token decoded more bytes than it declared.
    #[error("token 0x{tag:02X} declared {declared} bytes but decoding needed more")]
    TokenOverrun {
        /// Tag byte.
        tag: u8,
        /// Declared body length.
        declared: usize,
    },

    /// A row token arrived before any column metadata.
    #[error("row token 0x{0:02X} without preceding column metadata")]
    MissingColumnMetadata(u8),

    /// Bytes remain in a message after its terminal DONE token.
    #[error("{remaining} bytes left after terminal DONE token")]
    TrailingBytes {
        /// Unconsumed byte count.
        remaining: usize,
    },

    /// A message ended without a terminal DONE token.
    #[error("token stream ended without a terminal DONE token")]
    MissingDone,

    /// Column type byte this decoder cannot handle.
    #[error("unsupported data type: 0x{0:02X}")]
    UnsupportedDataType(u8),

    /// Environment change carries an unknown sub-type.
    #[error("invalid environment change type: {0}")]
    InvalidEnvChangeType(u8),

    /// Malformed UTF-16 in a string field.
    #[error("invalid UTF-16 in {0}")]
    InvalidUtf16(&'static str),

    /// String too long for its length prefix.
    #[error("{field} is {len} characters, limit is {max}")]
    StringTooLong {
        /// Field being encoded.
        field: &'static str,
        /// Length in UTF-16 code units.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// A field holds a value outside its legal range.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u64,
    },
}
