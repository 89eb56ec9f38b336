//! Writer output re-read through the reader reproduces the payload exactly.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use tds_framing::{BufferPool, MessageReader, PacketWriter};
use tds_wire::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, WireSink};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Write `chunks` as one message and return the raw wire bytes.
fn frame(packet_size: usize, chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut writer = PacketWriter::new(BufferPool::new(8, 1024), packet_size).unwrap();
    writer
        .start_message(PacketType::SqlBatch, PacketStatus::NORMAL)
        .unwrap();
    for (i, chunk) in chunks.iter().enumerate() {
        // alternate between span writes and sink writes
        if i % 2 == 0 {
            let span = writer.get_writable_span(chunk.len()).unwrap();
            span[..chunk.len()].copy_from_slice(chunk);
            writer.advance(chunk.len(), false).unwrap();
        } else {
            writer.write_bytes(chunk);
        }
    }
    writer.advance(0, true).unwrap();

    runtime().block_on(async {
        let mut wire = Vec::new();
        writer.flush(&mut wire).await.unwrap();
        wire
    })
}

fn headers(wire: &[u8]) -> Vec<PacketHeader> {
    let mut rest = wire;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let header = PacketHeader::decode(&mut &rest[..PACKET_HEADER_SIZE]).unwrap();
        rest = &rest[header.length as usize..];
        out.push(header);
    }
    out
}

proptest! {
    #[test]
    fn framed_payload_round_trips(
        packet_size in 512usize..1600,
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..1200), 0..8),
    ) {
        let expected: Vec<u8> = chunks.concat();
        let wire = frame(packet_size, &chunks);

        let capacity = packet_size - PACKET_HEADER_SIZE;
        let headers = headers(&wire);
        prop_assert_eq!(headers.len(), expected.len().div_ceil(capacity).max(1));
        for (idx, header) in headers.iter().enumerate() {
            prop_assert!(header.length as usize <= packet_size);
            prop_assert_eq!(header.packet_id as usize, idx + 1);
            prop_assert_eq!(header.is_end_of_message(), idx == headers.len() - 1);
        }

        let message = runtime().block_on(async {
            let mut reader = MessageReader::with_max_packet_size(&wire[..], packet_size);
            reader.read_message(PacketType::SqlBatch).await.unwrap().unwrap()
        });
        prop_assert_eq!(message.packet_count, headers.len());
        prop_assert_eq!(&message.payload[..], &expected[..]);
    }
}
