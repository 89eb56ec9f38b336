//! # tds-testing
//!
//! Test infrastructure for the TDS driver crates.
//!
//! The centerpiece is [`MockServer`], a scriptable server that completes
//! the PRELOGIN/LOGIN7 handshake and answers SQL batches from a table of
//! [`MockResponse`]s. It accepts TCP connections on an ephemeral port and
//! in-memory connections over `tokio::io::duplex`, and records what every
//! client sent.
//!
//! ```rust,ignore
//! use tds_testing::{MockColumn, MockResponse, MockServer, ScalarValue};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockServer::builder()
//!         .with_response(
//!             "SELECT id, name FROM users",
//!             MockResponse::rows(
//!                 vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!                 vec![vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())]],
//!             ),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let stream = server.connect_duplex();
//!     // drive a client over `stream`, then inspect server.batches()
//! }
//! ```
//!
//! [`TokenWriter`] builds response token streams by hand, for tests that
//! need exact or deliberately broken server output.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;
pub mod tokens;

pub use mock_server::{
    LoginBehavior, MockResponse, MockServer, MockServerBuilder, MockServerConfig, MockServerError,
    RecordedBatch, RecordedLogin, ResponseFn,
};
pub use tokens::{MockColumn, ScalarValue, TokenWriter};
