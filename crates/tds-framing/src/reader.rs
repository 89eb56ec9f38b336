//! Packet framer, reader side.
//!
//! [`PacketDecoder`] cuts physical packets out of the byte stream. It never
//! returns a short packet: when the declared length is not buffered yet it
//! asks the framed reader for more bytes and tries again.
//!
//! [`MessageAssembler`] glues payloads together until END_OF_MESSAGE, and
//! [`MessageReader`] combines both over an `AsyncRead`.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use pin_project_lite::pin_project;
use tds_wire::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketType};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use crate::error::CodecError;

/// One physical packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Payload without the header.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from its parts.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Whether this packet ends its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// `tokio_util` decoder yielding one [`Packet`] per header.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a decoder accepting packets up to `max_packet_size` bytes.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.clamp(PACKET_HEADER_SIZE, MAX_PACKET_SIZE),
        }
    }

    /// Largest packet accepted.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Change the largest packet accepted.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.clamp(PACKET_HEADER_SIZE, MAX_PACKET_SIZE);
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketDecoder {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        // Validate before waiting on the body so a bogus length faults
        // instead of stalling.
        let header = PacketHeader::decode(&mut &src[..PACKET_HEADER_SIZE])?;
        header.validate_length(self.max_packet_size)?;

        let length = header.length as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(length).freeze();
        let payload = packet.split_off(PACKET_HEADER_SIZE);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            "decoded packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }
}

/// A logical message reassembled from one or more packets.
#[derive(Debug, Clone)]
pub struct Message {
    /// Type shared by every packet of the message.
    pub packet_type: PacketType,
    /// Sender id from the first packet.
    pub spid: u16,
    /// Number of packets the message arrived in.
    pub packet_count: usize,
    /// Concatenated payload.
    pub payload: Bytes,
}

impl Message {
    /// Payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Reassembles packets into messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
    /// Type and sender id of the message in progress.
    head: Option<(PacketType, u16)>,
    packet_count: usize,
}

impl MessageAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet. Returns the message once END_OF_MESSAGE is seen.
    ///
    /// A packet whose type differs from the first packet of the message is a
    /// parsing fault.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Message>, CodecError> {
        let (packet_type, spid) = match self.head {
            Some((expected, spid)) => {
                if packet.header.packet_type != expected {
                    return Err(CodecError::UnexpectedPacketType {
                        expected,
                        actual: packet.header.packet_type,
                    });
                }
                (expected, spid)
            }
            None => (packet.header.packet_type, packet.header.spid),
        };
        self.packet_count += 1;

        if !packet.is_end_of_message() {
            self.head = Some((packet_type, spid));
            self.buffer.extend_from_slice(&packet.payload);
            return Ok(None);
        }

        // Single-packet messages skip the copy.
        let payload = if self.buffer.is_empty() {
            packet.payload
        } else {
            self.buffer.extend_from_slice(&packet.payload);
            self.buffer.split().freeze()
        };

        let message = Message {
            packet_type,
            spid,
            packet_count: self.packet_count,
            payload,
        };
        self.head = None;
        self.packet_count = 0;
        Ok(Some(message))
    }

    /// Whether a message has started but not finished.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.head.is_some()
    }

    /// Packets accumulated for the message in progress.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Forget any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.head = None;
        self.packet_count = 0;
    }
}

pin_project! {
    /// Reads whole messages off an async transport.
    ///
    /// As a [`Stream`] it yields every message regardless of type; use
    /// [`read_message`](MessageReader::read_message) to also check the type
    /// against the path being read.
    pub struct MessageReader<R> {
        #[pin]
        frames: FramedRead<R, PacketDecoder>,
        assembler: MessageAssembler,
    }
}

impl<R> MessageReader<R>
where
    R: AsyncRead,
{
    /// Create a reader accepting packets up to the protocol maximum.
    pub fn new(transport: R) -> Self {
        Self::with_max_packet_size(transport, MAX_PACKET_SIZE)
    }

    /// Create a reader rejecting packets larger than `max_packet_size`.
    pub fn with_max_packet_size(transport: R, max_packet_size: usize) -> Self {
        Self {
            frames: FramedRead::with_capacity(
                transport,
                PacketDecoder::new(max_packet_size),
                DEFAULT_PACKET_SIZE,
            ),
            assembler: MessageAssembler::new(),
        }
    }

    /// Change the largest packet accepted, e.g. after a packet-size change.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.frames.decoder_mut().set_max_packet_size(size);
    }

    /// Largest packet accepted.
    pub fn max_packet_size(&self) -> usize {
        self.frames.decoder().max_packet_size()
    }

    /// Whether a message has started but not finished.
    pub fn has_partial(&self) -> bool {
        self.assembler.has_partial()
    }

    /// Bytes received but not yet framed.
    pub fn buffered_len(&self) -> usize {
        self.frames.read_buffer().len()
    }

    /// Underlying transport.
    pub fn get_ref(&self) -> &R {
        self.frames.get_ref()
    }

    /// Consume the reader, returning the transport.
    pub fn into_inner(self) -> R {
        self.frames.into_inner()
    }
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Read the next message, requiring it to be of `expected` type.
    ///
    /// The type is checked on the first packet's header, before any of a
    /// multi-packet payload is buffered. Returns `Ok(None)` on a clean EOF
    /// between messages.
    pub async fn read_message(
        &mut self,
        expected: PacketType,
    ) -> Result<Option<Message>, CodecError> {
        loop {
            let Some(packet) = self.frames.next().await else {
                if self.assembler.has_partial() {
                    self.assembler.clear();
                    return Err(CodecError::ConnectionClosed);
                }
                return Ok(None);
            };
            let packet = packet?;
            if !self.assembler.has_partial() && packet.header.packet_type != expected {
                return Err(CodecError::UnexpectedPacketType {
                    expected,
                    actual: packet.header.packet_type,
                });
            }
            if let Some(message) = self.assembler.push(packet)? {
                return Ok(Some(message));
            }
        }
    }

    /// Read the next message of any type.
    pub async fn read_any_message(&mut self) -> Result<Option<Message>, CodecError> {
        self.next().await.transpose()
    }
}

impl<R> Stream for MessageReader<R>
where
    R: AsyncRead,
{
    type Item = Result<Message, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.frames.as_mut().poll_next(cx)) {
                Some(Ok(packet)) => match this.assembler.push(packet) {
                    Ok(Some(message)) => return Poll::Ready(Some(Ok(message))),
                    Ok(None) => {}
                    Err(err) => return Poll::Ready(Some(Err(err))),
                },
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None if this.assembler.has_partial() => {
                    this.assembler.clear();
                    return Poll::Ready(Some(Err(CodecError::ConnectionClosed)));
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<R> std::fmt::Debug for MessageReader<R>
where
    R: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("transport", self.frames.get_ref())
            .field("has_partial", &self.assembler.has_partial())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_wire::PacketStatus;
    use tokio::io::AsyncWriteExt;

    fn raw_packet(packet_type: PacketType, eom: bool, id: u8, payload: &[u8]) -> Vec<u8> {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let header = PacketHeader::new(packet_type, status, (8 + payload.len()) as u16)
            .with_packet_id(id)
            .with_spid(53);
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decoder_waits_for_full_packet() {
        let mut decoder = PacketDecoder::default();
        let bytes = raw_packet(PacketType::TabularResult, true, 1, b"abcd");

        let mut src = BytesMut::from(&bytes[..10]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 10);

        src.extend_from_slice(&bytes[10..]);
        let packet = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"abcd");
        assert_eq!(packet.header.spid, 53);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decoder_rejects_bad_lengths() {
        let mut decoder = PacketDecoder::new(512);

        let mut short = BytesMut::from(&[0x04, 0x01, 0x00, 0x04, 0, 0, 1, 0][..]);
        assert!(decoder.decode(&mut short).unwrap_err().is_parsing_fault());

        let mut long = BytesMut::from(&[0x04, 0x01, 0x02, 0x01, 0, 0, 1, 0][..]);
        assert!(matches!(
            decoder.decode(&mut long),
            Err(CodecError::Protocol(tds_wire::ProtocolError::InvalidPacketLength { length: 513, .. }))
        ));

        let mut bad_type = BytesMut::from(&[0x7F, 0x01, 0x00, 0x08, 0, 0, 1, 0][..]);
        assert!(decoder.decode(&mut bad_type).is_err());
    }

    #[test]
    fn test_assembler_joins_packets() {
        let mut assembler = MessageAssembler::new();
        let mut decoder = PacketDecoder::default();

        let mut src = BytesMut::new();
        src.extend_from_slice(&raw_packet(PacketType::TabularResult, false, 1, b"hello "));
        src.extend_from_slice(&raw_packet(PacketType::TabularResult, true, 2, b"world"));

        let first = decoder.decode(&mut src).unwrap().unwrap();
        assert!(assembler.push(first).unwrap().is_none());
        assert!(assembler.has_partial());

        let second = decoder.decode(&mut src).unwrap().unwrap();
        let message = assembler.push(second).unwrap().unwrap();
        assert_eq!(&message.payload[..], b"hello world");
        assert_eq!(message.packet_count, 2);
        assert_eq!(message.spid, 53);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_assembler_rejects_mixed_types() {
        let mut assembler = MessageAssembler::new();
        let mut decoder = PacketDecoder::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&raw_packet(PacketType::TabularResult, false, 1, b"a"));
        src.extend_from_slice(&raw_packet(PacketType::SqlBatch, true, 2, b"b"));

        assembler
            .push(decoder.decode(&mut src).unwrap().unwrap())
            .unwrap();
        let err = assembler
            .push(decoder.decode(&mut src).unwrap().unwrap())
            .unwrap_err();
        assert!(err.is_parsing_fault());
    }

    #[tokio::test]
    async fn test_reader_checks_type_and_eof() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);

        client
            .write_all(&raw_packet(PacketType::TabularResult, true, 1, b"ok"))
            .await
            .unwrap();
        client
            .write_all(&raw_packet(PacketType::SqlBatch, true, 1, b"no"))
            .await
            .unwrap();
        drop(client);

        let message = reader
            .read_message(PacketType::TabularResult)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&message.payload[..], b"ok");

        assert!(matches!(
            reader.read_message(PacketType::TabularResult).await,
            Err(CodecError::UnexpectedPacketType {
                expected: PacketType::TabularResult,
                actual: PacketType::SqlBatch,
            })
        ));
        assert!(reader.read_message(PacketType::TabularResult).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_rejects_type_at_first_packet() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);

        // the rest of this message never arrives
        client
            .write_all(&raw_packet(PacketType::SqlBatch, false, 1, b"first of many"))
            .await
            .unwrap();

        let read = reader.read_message(PacketType::TabularResult);
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), read)
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(CodecError::UnexpectedPacketType {
                expected: PacketType::TabularResult,
                actual: PacketType::SqlBatch,
            })
        ));
        assert!(!reader.has_partial());
        drop(client);
    }

    #[tokio::test]
    async fn test_reader_eof_mid_message() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);

        client
            .write_all(&raw_packet(PacketType::TabularResult, false, 1, b"part"))
            .await
            .unwrap();
        drop(client);

        assert!(matches!(
            reader.read_any_message().await,
            Err(CodecError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reader_waits_across_partial_deliveries() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);
        let bytes = raw_packet(PacketType::TabularResult, true, 1, &[7; 100]);

        let feeder = tokio::spawn(async move {
            for chunk in bytes.chunks(13) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let message = reader.read_any_message().await.unwrap().unwrap();
        assert_eq!(message.len(), 100);
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_over_scripted_reads() {
        let mut bytes = raw_packet(PacketType::TabularResult, false, 1, b"split ");
        bytes.extend_from_slice(&raw_packet(PacketType::TabularResult, true, 2, b"header"));

        // cut inside the first header and inside the second header
        let transport = tokio_test::io::Builder::new()
            .read(&bytes[..5])
            .read(&bytes[5..17])
            .read(&bytes[17..])
            .build();
        let mut reader = MessageReader::new(transport);

        let message = reader
            .read_message(PacketType::TabularResult)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&message.payload[..], b"split header");
        assert_eq!(message.packet_count, 2);
        assert!(reader.read_any_message().await.unwrap().is_none());
    }
}
