//! # tds-framing
//!
//! Buffer pooling and packet framing for TDS connections.
//!
//! This crate turns logical messages into physical packets and back:
//!
//! ```text
//! encoder ─▶ PacketWriter ─▶ SegmentWriter ─▶ BufferPool segments ─▶ AsyncWrite
//! AsyncRead ─▶ PacketDecoder ─▶ MessageAssembler ─▶ MessageReader ─▶ token decoder
//! ```
//!
//! ## Pipelining
//!
//! [`PacketWriter`] keeps every completed message pending until
//! [`PacketWriter::flush`] is called, so several commands can share one
//! write to the transport.
//!
//! ```rust
//! use tds_framing::{BufferPool, PacketWriter};
//! use tds_wire::{PacketStatus, PacketType};
//!
//! # tokio_test::block_on(async {
//! let mut writer = PacketWriter::new(BufferPool::default(), 512)?;
//! writer.write_message(PacketType::SqlBatch, PacketStatus::NORMAL, b"first")?;
//! writer.write_message(PacketType::SqlBatch, PacketStatus::NORMAL, b"second")?;
//!
//! let mut wire = Vec::new();
//! let written = writer.flush(&mut wire).await?;
//! assert_eq!(written, 8 + 5 + 8 + 6);
//! # Ok::<_, tds_framing::CodecError>(())
//! # }).unwrap();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod error;
pub mod reader;
pub mod writer;

pub use buffer::{BufferPool, PoolStats, PooledBuffer, SegmentWriter};
pub use error::CodecError;
pub use reader::{Message, MessageAssembler, MessageReader, Packet, PacketDecoder};
pub use writer::{PacketWriter, validate_packet_size};
