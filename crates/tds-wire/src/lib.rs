//! # tds-wire
//!
//! IO-agnostic building blocks of the TDS wire protocol: packet headers,
//! an explicit byte cursor, the response token decoder, and encoders for the
//! PRELOGIN, LOGIN7 and SQL batch requests.
//!
//! Nothing here touches a socket. `tds-framing` moves these structures over
//! an async transport and `tds-mux` schedules them across connections.
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use tds_wire::{Token, TokenStream};
//!
//! // DONE: status 0, curcmd 0, 12 rows
//! let payload = Bytes::from_static(&[0xFD, 0, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0]);
//! let mut stream = TokenStream::new(payload);
//! match stream.next_token().unwrap() {
//!     Some(Token::Done(done)) => assert_eq!(done.row_count, 12),
//!     _ => unreachable!(),
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod cursor;
pub mod error;
pub mod headers;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod sql_batch;
pub mod token;
pub mod types;
pub mod value;
pub mod version;

pub use codec::WireSink;
pub use cursor::ByteCursor;
pub use error::ProtocolError;
pub use headers::RequestHeader;
pub use login7::Login7;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType, payload_capacity,
};
pub use prelogin::{EncryptionLevel, PreLogin};
pub use sql_batch::SqlBatch;
pub use token::{
    ColMetaData, ColumnData, DecodedToken, Done, DoneStatus, EnvChange, EnvChangeType,
    EnvChangeValue, LoginAck, Row, ServerMessage, Token, TokenStream, TokenType,
    UnknownTokenPolicy, decode_token,
};
pub use types::TypeId;
pub use value::SqlValue;
pub use version::TdsVersion;
