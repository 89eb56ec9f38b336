//! Packet header layout.
//!
//! Every physical packet starts with an 8-byte header. Unlike most payload
//! integers, the length and sender-id fields are big-endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest packet size the header length field can express.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Smallest packet size a server will negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Packet size used until the server announces another one.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Message type carried in byte 0 of every packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Server response (token stream).
    TabularResult = 0x04,
    /// Attention signal.
    Attention = 0x06,
    /// Login request.
    Tds7Login = 0x10,
    /// Pre-login negotiation.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x10 => Ok(Self::Tds7Login),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// Packet status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// More packets follow in this message.
        const NORMAL = 0x00;
        /// Last packet of the message.
        const END_OF_MESSAGE = 0x01;
        /// Ignore this event.
        const IGNORE_EVENT = 0x02;
        /// Reset the session before processing the request.
        const RESET_CONNECTION = 0x08;
        /// Reset the session but keep the transaction.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

impl PacketStatus {
    /// Bits that only belong on the first packet of a message.
    pub const FIRST_PACKET_ONLY: Self =
        Self::RESET_CONNECTION.union(Self::RESET_CONNECTION_KEEP_TRANSACTION);
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Sender id (server process id on responses).
    pub spid: u16,
    /// Sequence number within the message, starting at 1.
    pub packet_id: u8,
    /// Reserved, always 0.
    pub window: u8,
}

impl PacketHeader {
    /// Create a header with sender id 0 and packet id 1.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 1,
            window: 0,
        }
    }

    /// Parse a header from the front of `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        Ok(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Append the header to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Header as a fixed array, for backfilling a reserved slot.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let [len_hi, len_lo] = self.length.to_be_bytes();
        let [spid_hi, spid_lo] = self.spid.to_be_bytes();
        [
            self.packet_type as u8,
            self.status.bits(),
            len_hi,
            len_lo,
            spid_hi,
            spid_lo,
            self.packet_id,
            self.window,
        ]
    }

    /// Check the declared length against `[PACKET_HEADER_SIZE, max]`.
    pub fn validate_length(&self, max: usize) -> Result<(), ProtocolError> {
        let length = self.length as usize;
        if length < PACKET_HEADER_SIZE || length > max {
            return Err(ProtocolError::InvalidPacketLength {
                length,
                min: PACKET_HEADER_SIZE,
                max,
            });
        }
        Ok(())
    }

    /// Payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Whether this is the last packet of its message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet id.
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the sender id.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

/// Payload bytes available per packet at the given packet size.
#[must_use]
pub const fn payload_capacity(packet_size: usize) -> usize {
    packet_size.saturating_sub(PACKET_HEADER_SIZE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian() {
        let header = PacketHeader::new(PacketType::PreLogin, PacketStatus::END_OF_MESSAGE, 0x04D1)
            .with_spid(0x0102)
            .with_packet_id(3);

        assert_eq!(
            header.to_bytes(),
            [0x12, 0x01, 0x04, 0xD1, 0x01, 0x02, 0x03, 0x00]
        );

        let mut src = &header.to_bytes()[..];
        assert_eq!(PacketHeader::decode(&mut src).unwrap(), header);
    }

    #[test]
    fn test_short_header_is_incomplete() {
        let mut src = &[0x04u8, 0x01, 0x00][..];
        let err = PacketHeader::decode(&mut src).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::IncompletePacket {
                expected: 8,
                actual: 3
            }
        );
    }

    #[test]
    fn test_unknown_type_and_status_rejected() {
        let mut src = &[0x55u8, 0x01, 0x00, 0x08, 0, 0, 1, 0][..];
        assert_eq!(
            PacketHeader::decode(&mut src).unwrap_err(),
            ProtocolError::InvalidPacketType(0x55)
        );

        let mut src = &[0x04u8, 0x80, 0x00, 0x08, 0, 0, 1, 0][..];
        assert_eq!(
            PacketHeader::decode(&mut src).unwrap_err(),
            ProtocolError::InvalidPacketStatus(0x80)
        );
    }

    #[test]
    fn test_validate_length() {
        let header = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 4);
        assert!(header.validate_length(4096).is_err());

        let header = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 5000);
        assert!(header.validate_length(4096).is_err());
        assert!(header.validate_length(8192).is_ok());
        assert_eq!(header.payload_length(), 4992);
    }

    #[test]
    fn test_payload_capacity() {
        assert_eq!(payload_capacity(1233), 1225);
        assert_eq!(payload_capacity(DEFAULT_PACKET_SIZE), 4088);
    }
}
