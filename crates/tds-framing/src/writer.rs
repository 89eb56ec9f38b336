//! Packet framer, writer side.
//!
//! [`PacketWriter`] slices logical messages into physical packets as bytes
//! are committed, backfilling each 8-byte header once its payload length is
//! known. Several messages can be written before a single [`flush`], which is
//! what lets callers pipeline commands.
//!
//! A full packet is only closed once more payload arrives for the same
//! message. A message that ends exactly on a packet boundary therefore never
//! produces a trailing empty packet.
//!
//! [`flush`]: PacketWriter::flush

use std::fmt;

use tds_wire::{
    MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    WireSink, payload_capacity,
};
use tokio::io::AsyncWrite;

use crate::buffer::{BufferPool, SegmentWriter};
use crate::error::CodecError;

/// Validate a packet size against the range the header can carry.
pub fn validate_packet_size(size: usize) -> Result<usize, CodecError> {
    if (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        Ok(size)
    } else {
        Err(CodecError::InvalidPacketSize {
            size,
            min: MIN_PACKET_SIZE,
            max: MAX_PACKET_SIZE,
        })
    }
}

/// State of the message being written.
#[derive(Debug, Clone, Copy)]
struct OpenMessage {
    packet_type: PacketType,
    /// Status for the current packet; first-packet-only bits are dropped
    /// after the first rotation.
    status: PacketStatus,
    packet_id: u8,
    /// Where the current packet's header was reserved.
    header_pos: usize,
    /// Where the message began, for `abort_message`.
    start_pos: usize,
    /// Payload bytes committed to the current packet.
    used: usize,
    packets: usize,
}

impl OpenMessage {
    fn header(&self, last: bool) -> PacketHeader {
        let mut status = self.status;
        if last {
            status |= PacketStatus::END_OF_MESSAGE;
        }
        PacketHeader::new(
            self.packet_type,
            status,
            (PACKET_HEADER_SIZE + self.used) as u16,
        )
        .with_packet_id(self.packet_id)
    }
}

/// The region handed out by the last `get_writable_span`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    None,
    /// Straight into the current packet's payload.
    Direct(usize),
    /// Into the scratch buffer; spilled across packets on `advance`.
    Scratch(usize),
}

/// Streams logical messages into packets backed by pooled segments.
pub struct PacketWriter {
    out: SegmentWriter,
    packet_size: usize,
    message: Option<OpenMessage>,
    scratch: Vec<u8>,
    span: Span,
    /// Error raised inside a `WireSink` write, reported by the next
    /// fallible call.
    fault: Option<CodecError>,
}

impl PacketWriter {
    /// Create a writer emitting packets of `packet_size` bytes.
    pub fn new(pool: BufferPool, packet_size: usize) -> Result<Self, CodecError> {
        Ok(Self {
            out: SegmentWriter::new(pool),
            packet_size: validate_packet_size(packet_size)?,
            message: None,
            scratch: Vec::new(),
            span: Span::None,
            fault: None,
        })
    }

    /// Negotiated packet size, header included.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Payload bytes per packet.
    #[must_use]
    pub fn payload_capacity(&self) -> usize {
        payload_capacity(self.packet_size)
    }

    /// Switch to a new packet size. Only allowed between messages.
    pub fn set_packet_size(&mut self, packet_size: usize) -> Result<(), CodecError> {
        if self.message.is_some() {
            return Err(CodecError::MessageAlreadyOpen);
        }
        self.packet_size = validate_packet_size(packet_size)?;
        tracing::debug!(packet_size, "packet size changed");
        Ok(())
    }

    /// Whether a message is open.
    #[must_use]
    pub fn is_message_open(&self) -> bool {
        self.message.is_some()
    }

    /// Begin a new logical message.
    ///
    /// `status` may carry reset bits, which are applied to the first packet
    /// only. END_OF_MESSAGE belongs to the framer and is rejected.
    pub fn start_message(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
    ) -> Result<(), CodecError> {
        self.take_fault()?;
        if self.message.is_some() {
            return Err(CodecError::MessageAlreadyOpen);
        }
        if status.contains(PacketStatus::END_OF_MESSAGE) {
            return Err(CodecError::ReservedStatusBit(status.bits()));
        }

        let header_pos = self.out.reserve_contiguous(PACKET_HEADER_SIZE);
        self.message = Some(OpenMessage {
            packet_type,
            status,
            packet_id: 1,
            header_pos,
            start_pos: header_pos,
            used: 0,
            packets: 1,
        });
        self.span = Span::None;
        Ok(())
    }

    /// Get a contiguous region to write at least `size_hint` payload bytes.
    ///
    /// While the current packet has room for the hint, the region is the
    /// rest of that packet's payload. Otherwise the region is a scratch
    /// buffer whose committed bytes are spread over as many packets as
    /// needed by [`advance`](PacketWriter::advance).
    pub fn get_writable_span(&mut self, size_hint: usize) -> Result<&mut [u8], CodecError> {
        let capacity = self.payload_capacity();
        let msg = self.message.as_ref().ok_or(CodecError::NoOpenMessage)?;
        let room = capacity - msg.used;

        if room > 0 && size_hint <= room {
            self.span = Span::Direct(room);
            return Ok(self.out.get_writable_region(room));
        }

        let len = size_hint.max(capacity);
        self.scratch.clear();
        self.scratch.resize(len, 0);
        self.span = Span::Scratch(len);
        Ok(&mut self.scratch[..])
    }

    /// Commit `n` bytes of the last span and optionally end the message.
    ///
    /// `advance(0, true)` always finalizes exactly one terminal packet, with
    /// an empty payload if nothing was written since the last rotation.
    pub fn advance(&mut self, n: usize, end_message: bool) -> Result<(), CodecError> {
        self.take_fault()?;
        if self.message.is_none() {
            return Err(CodecError::NoOpenMessage);
        }

        let span = std::mem::replace(&mut self.span, Span::None);
        match span {
            Span::Direct(available) | Span::Scratch(available) if n > available => {
                return Err(CodecError::AdvanceOutOfRange {
                    requested: n,
                    available,
                });
            }
            Span::None if n > 0 => {
                return Err(CodecError::AdvanceOutOfRange {
                    requested: n,
                    available: 0,
                });
            }
            Span::Direct(_) => {
                self.out.advance(n)?;
                if let Some(msg) = self.message.as_mut() {
                    msg.used += n;
                }
            }
            Span::Scratch(_) => {
                let scratch = std::mem::take(&mut self.scratch);
                let spilled = self.spill(&scratch[..n]);
                self.scratch = scratch;
                spilled?;
            }
            Span::None => {}
        }

        if end_message {
            self.end_message()?;
        }
        Ok(())
    }

    /// Write a complete message in one call.
    pub fn write_message(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        self.start_message(packet_type, status)?;
        self.spill(payload)?;
        self.advance(0, true)
    }

    /// Write a complete message produced by `encode` through [`WireSink`].
    ///
    /// If `encode` fails the partial message is rolled back and earlier
    /// pending messages are kept.
    pub fn write_with<F, E>(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
        encode: F,
    ) -> Result<(), CodecError>
    where
        F: FnOnce(&mut Self) -> Result<(), E>,
        E: Into<CodecError>,
    {
        self.start_message(packet_type, status)?;
        if let Err(err) = encode(self) {
            self.abort_message()?;
            return Err(err.into());
        }
        if let Err(err) = self.advance(0, true) {
            self.abort_message()?;
            return Err(err);
        }
        Ok(())
    }

    /// Drop the open message, keeping anything written before it.
    pub fn abort_message(&mut self) -> Result<(), CodecError> {
        self.span = Span::None;
        self.fault = None;
        if let Some(msg) = self.message.take() {
            self.out.truncate(msg.start_pos)?;
            tracing::debug!(packet_type = ?msg.packet_type, "aborted partially written message");
        }
        Ok(())
    }

    /// Bytes of complete or in-progress packets waiting for a flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.out.pending_len()
    }

    /// Write all pending packets to `io`.
    ///
    /// Rejected while a message is open, since its current header has not
    /// been backfilled yet.
    pub async fn flush<W>(&mut self, io: &mut W) -> Result<usize, CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.take_fault()?;
        if self.message.is_some() {
            return Err(CodecError::MessageAlreadyOpen);
        }
        self.out.flush_to(io).await
    }

    /// Drop every pending byte, including an open message.
    pub fn discard(&mut self) {
        self.message = None;
        self.span = Span::None;
        self.fault = None;
        self.out.discard();
    }

    /// Pending bytes, segment by segment.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.out.chunks()
    }

    fn take_fault(&mut self) -> Result<(), CodecError> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copy `data` into the open message, rotating packets as they fill.
    fn spill(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
        let capacity = self.payload_capacity();
        while !data.is_empty() {
            self.rotate_if_full()?;
            let msg = self.message.as_mut().ok_or(CodecError::NoOpenMessage)?;
            let take = (capacity - msg.used).min(data.len());
            self.out.extend_from_slice(&data[..take]);
            msg.used += take;
            data = &data[take..];
        }
        Ok(())
    }

    fn rotate_if_full(&mut self) -> Result<(), CodecError> {
        let capacity = self.payload_capacity();
        let Some(msg) = self.message.as_mut() else {
            return Err(CodecError::NoOpenMessage);
        };
        if msg.used < capacity {
            return Ok(());
        }

        let header = msg.header(false);
        self.out.patch(msg.header_pos, &header.to_bytes())?;

        msg.packet_id = match msg.packet_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        msg.status.remove(PacketStatus::FIRST_PACKET_ONLY);
        msg.header_pos = self.out.reserve_contiguous(PACKET_HEADER_SIZE);
        msg.used = 0;
        msg.packets += 1;
        Ok(())
    }

    fn end_message(&mut self) -> Result<(), CodecError> {
        let msg = self.message.take().ok_or(CodecError::NoOpenMessage)?;
        let header = msg.header(true);
        self.out.patch(msg.header_pos, &header.to_bytes())?;

        tracing::trace!(
            packet_type = ?msg.packet_type,
            packets = msg.packets,
            bytes = self.out.position() - msg.start_pos,
            "message framed"
        );
        Ok(())
    }
}

impl WireSink for PacketWriter {
    fn write_bytes(&mut self, src: &[u8]) {
        if self.fault.is_some() {
            return;
        }
        self.span = Span::None;
        if let Err(err) = self.spill(src) {
            self.fault = Some(err);
        }
    }
}

impl fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketWriter")
            .field("packet_size", &self.packet_size)
            .field("message", &self.message)
            .field("pending", &self.out.pending_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn writer(packet_size: usize) -> PacketWriter {
        PacketWriter::new(BufferPool::new(16, 4096), packet_size).unwrap()
    }

    /// Split pending output into (header, payload) pairs, checking that each
    /// declared length matches the bytes that follow.
    fn packets(writer: &PacketWriter) -> Vec<(PacketHeader, Vec<u8>)> {
        let bytes: Vec<u8> = writer.chunks().flatten().copied().collect();
        let mut rest = &bytes[..];
        let mut out = Vec::new();
        while !rest.is_empty() {
            let header = PacketHeader::decode(&mut &rest[..PACKET_HEADER_SIZE]).unwrap();
            let len = header.length as usize;
            assert!(len <= rest.len(), "declared length past end of output");
            out.push((header, rest[PACKET_HEADER_SIZE..len].to_vec()));
            rest = &rest[len..];
        }
        out
    }

    fn payload(packets: &[(PacketHeader, Vec<u8>)]) -> Vec<u8> {
        packets.iter().flat_map(|(_, p)| p.iter().copied()).collect()
    }

    fn assert_single_eom(packets: &[(PacketHeader, Vec<u8>)]) {
        let (last, rest) = packets.split_last().unwrap();
        assert!(last.0.is_end_of_message());
        assert!(rest.iter().all(|(h, _)| !h.is_end_of_message()));
        for (idx, (header, _)) in packets.iter().enumerate() {
            assert_eq!(header.packet_id as usize, idx + 1);
            assert_eq!(header.window, 0);
        }
    }

    #[test]
    fn test_prelogin_spans_four_packets_at_1233() {
        let mut w = writer(1233);
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        w.start_message(PacketType::PreLogin, PacketStatus::NORMAL).unwrap();
        let span = w.get_writable_span(data.len()).unwrap();
        span[..data.len()].copy_from_slice(&data);
        w.advance(data.len(), true).unwrap();

        let packets = packets(&w);
        let sizes: Vec<u16> = packets.iter().map(|(h, _)| h.length).collect();
        // 3 * 1225 + 421 = 4096
        assert_eq!(sizes, vec![1233, 1233, 1233, 429]);
        assert!(packets.iter().all(|(h, _)| h.packet_type == PacketType::PreLogin));
        assert_single_eom(&packets);
        assert_eq!(payload(&packets), data);
        assert_eq!(w.pending_len(), 1233 * 3 + 429);
    }

    #[test]
    fn test_exact_boundary_has_no_empty_tail() {
        let mut w = writer(512);
        w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL).unwrap();
        w.write_bytes(&[0xAB; 504 * 2]);
        w.advance(0, true).unwrap();

        let packets = packets(&w);
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|(h, _)| h.length == 512));
        assert_single_eom(&packets);
    }

    #[test]
    fn test_empty_message_is_one_header() {
        let mut w = writer(512);
        w.start_message(PacketType::Attention, PacketStatus::NORMAL).unwrap();
        w.advance(0, true).unwrap();

        let packets = packets(&w);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.length, 8);
        assert!(packets[0].0.is_end_of_message());
    }

    #[test]
    fn test_span_at_full_packet_does_not_rotate_early() {
        let mut w = writer(512);
        w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL).unwrap();
        w.write_bytes(&[1; 504]);

        // the packet is full; asking for a span and committing nothing must
        // not open a second packet
        let _ = w.get_writable_span(16).unwrap();
        w.advance(0, true).unwrap();

        let packets = packets(&w);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.length, 512);
    }

    #[test]
    fn test_straddling_writes_never_corrupt() {
        let mut w = writer(512);
        let mut expected = Vec::new();
        let mut next = 0u8;

        w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL).unwrap();
        for size in [1usize, 3, 7, 503, 504, 505, 2000, 12] {
            let bytes: Vec<u8> = (0..size)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            let span = w.get_writable_span(size).unwrap();
            assert!(span.len() >= size);
            span[..size].copy_from_slice(&bytes);
            w.advance(size, false).unwrap();
            expected.extend_from_slice(&bytes);
        }
        w.advance(0, true).unwrap();

        let packets = packets(&w);
        assert_eq!(packets.len(), expected.len().div_ceil(504));
        assert!(packets.iter().all(|(h, p)| h.length as usize == 8 + p.len()));
        assert_single_eom(&packets);
        assert_eq!(payload(&packets), expected);
    }

    #[test]
    fn test_reset_bits_only_on_first_packet() {
        let mut w = writer(512);
        w.start_message(PacketType::SqlBatch, PacketStatus::RESET_CONNECTION)
            .unwrap();
        w.write_bytes(&[0; 600]);
        w.advance(0, true).unwrap();

        let packets = packets(&w);
        assert_eq!(packets[0].0.status, PacketStatus::RESET_CONNECTION);
        assert_eq!(packets[1].0.status, PacketStatus::END_OF_MESSAGE);
    }

    #[test]
    fn test_misuse_is_rejected() {
        let mut w = writer(512);
        assert!(matches!(
            w.start_message(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE),
            Err(CodecError::ReservedStatusBit(0x01))
        ));
        assert!(matches!(
            w.advance(0, true),
            Err(CodecError::NoOpenMessage)
        ));
        assert!(matches!(
            w.get_writable_span(1),
            Err(CodecError::NoOpenMessage)
        ));

        w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL).unwrap();
        assert!(matches!(
            w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL),
            Err(CodecError::MessageAlreadyOpen)
        ));
        assert!(matches!(
            w.set_packet_size(1024),
            Err(CodecError::MessageAlreadyOpen)
        ));

        let offered = w.get_writable_span(4).unwrap().len();
        assert!(matches!(
            w.advance(offered + 1, false),
            Err(CodecError::AdvanceOutOfRange { .. })
        ));
    }

    #[test]
    fn test_write_without_message_surfaces_later() {
        let mut w = writer(512);
        w.write_u32_le(7);
        assert!(matches!(
            w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL),
            Err(CodecError::NoOpenMessage)
        ));
        assert_eq!(w.pending_len(), 0);
    }

    #[test]
    fn test_packet_size_bounds() {
        assert!(PacketWriter::new(BufferPool::default(), 511).is_err());
        assert!(PacketWriter::new(BufferPool::default(), 65536).is_err());

        let mut w = writer(4096);
        w.set_packet_size(512).unwrap();
        assert_eq!(w.payload_capacity(), 504);
    }

    #[test]
    fn test_abort_keeps_earlier_messages() {
        let mut w = writer(512);
        w.write_message(PacketType::SqlBatch, PacketStatus::NORMAL, b"first")
            .unwrap();
        let kept = w.pending_len();

        w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL).unwrap();
        w.write_bytes(&[9; 1500]);
        w.abort_message().unwrap();

        assert_eq!(w.pending_len(), kept);
        let packets = packets(&w);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1, b"first");
    }

    #[test]
    fn test_write_with_rolls_back_on_encode_error() {
        let mut w = writer(512);
        let result = w.write_with(PacketType::Tds7Login, PacketStatus::NORMAL, |sink| {
            sink.write_u32_le(1);
            Err(tds_wire::ProtocolError::MissingDone)
        });
        assert!(matches!(result, Err(CodecError::Protocol(_))));
        assert!(!w.is_message_open());
        assert_eq!(w.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_pipelined_messages_share_one_flush() {
        let mut w = writer(512);
        w.write_message(PacketType::SqlBatch, PacketStatus::NORMAL, &[1; 10])
            .unwrap();
        w.write_message(PacketType::SqlBatch, PacketStatus::NORMAL, &[2; 700])
            .unwrap();

        let mut wire: Vec<u8> = Vec::new();
        w.start_message(PacketType::SqlBatch, PacketStatus::NORMAL).unwrap();
        assert!(matches!(
            w.flush(&mut wire).await,
            Err(CodecError::MessageAlreadyOpen)
        ));
        w.abort_message().unwrap();

        let written = w.flush(&mut wire).await.unwrap();
        assert_eq!(written, 18 + 512 + 204);
        assert_eq!(wire.len(), written);
        assert_eq!(w.pending_len(), 0);
    }
}
