//! Framing error types.

use tds_wire::{PacketType, ProtocolError};
use thiserror::Error;

/// Errors raised by the buffer, writer and reader layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Malformed bytes on the wire.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport reached EOF in the middle of a message.
    #[error("connection closed mid-message")]
    ConnectionClosed,

    /// A packet arrived on a path that does not accept its type.
    #[error("unexpected packet type: expected {expected:?}, got {actual:?}")]
    UnexpectedPacketType {
        /// Type the caller was waiting for.
        expected: PacketType,
        /// Type found in the header.
        actual: PacketType,
    },

    /// `start_message` called while a message is open, or an operation that
    /// requires a closed message was attempted mid-message.
    #[error("a message is already open")]
    MessageAlreadyOpen,

    /// Write attempted without an open message.
    #[error("no message is open")]
    NoOpenMessage,

    /// The caller passed a status bit owned by the framer.
    #[error("status 0x{0:02X} carries END_OF_MESSAGE, which the framer sets itself")]
    ReservedStatusBit(u8),

    /// `advance` committed more bytes than the last span offered.
    #[error("advance({requested}) exceeds the {available} bytes offered")]
    AdvanceOutOfRange {
        /// Bytes the caller tried to commit.
        requested: usize,
        /// Bytes the last span exposed.
        available: usize,
    },

    /// Packet size outside the supported range.
    #[error("invalid packet size {size} (must be {min}..={max})")]
    InvalidPacketSize {
        /// Requested size.
        size: usize,
        /// Smallest accepted size.
        min: usize,
        /// Largest accepted size.
        max: usize,
    },

    /// Position handed to `patch` is no longer (or not yet) buffered.
    #[error("patch at {position} (+{len}) outside pending range {start}..{end}")]
    PatchOutOfRange {
        /// Absolute stream offset.
        position: usize,
        /// Bytes to overwrite.
        len: usize,
        /// First pending offset.
        start: usize,
        /// One past the last pending offset.
        end: usize,
    },
}

impl CodecError {
    /// Whether the error came from malformed or out-of-place bytes received
    /// from the peer.
    #[must_use]
    pub fn is_parsing_fault(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::UnexpectedPacketType { .. })
    }

    /// Whether the error reflects a misuse of the writer API rather than
    /// anything on the wire.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::MessageAlreadyOpen
                | Self::NoOpenMessage
                | Self::ReservedStatusBit(_)
                | Self::AdvanceOutOfRange { .. }
                | Self::InvalidPacketSize { .. }
                | Self::PatchOutOfRange { .. }
        )
    }

    /// Whether the transport itself is gone.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}
