//! Error types for sessions, slots and the pool.

use std::io;
use std::time::Duration;

use tds_framing::CodecError;
use tds_wire::{ProtocolError, ServerMessage};
use thiserror::Error;

use crate::session::SessionState;

/// Errors surfaced by sessions, operation slots and the pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed token or envelope in a server message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Packet framing or transport failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// IO failure while establishing a transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the server.
    #[error("server error {number} (class {class}, state {state}): {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Severity class.
        class: u8,
        /// Error state.
        state: u8,
        /// Message text.
        message: String,
        /// Server name, if reported.
        server: Option<String>,
        /// Procedure name, if the error came from one.
        procedure: Option<String>,
        /// Line number within the batch or procedure.
        line: i32,
    },

    /// The server insists on TLS, which this client does not negotiate.
    #[error("server requires encryption")]
    EncryptionRequired,

    /// The login response ended without a LOGINACK.
    #[error("login was not acknowledged by the server")]
    LoginNotAcknowledged,

    /// A token arrived where the protocol does not allow it.
    #[error("unexpected {0} token")]
    UnexpectedToken(&'static str),

    /// The session cannot take another slot right now.
    #[error("no slot available on this session")]
    SlotBusy,

    /// The session hit a fatal error or was closed.
    #[error("session is faulted or closed")]
    SessionFaulted,

    /// The session has not finished its handshake.
    #[error("session is not ready (state: {0:?})")]
    SessionNotReady(SessionState),

    /// The transport closed while a response was expected.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Establishing the transport or completing login timed out.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The response did not arrive in time.
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// No slot became available before the deadline.
    #[error("slot acquisition timed out after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A row accessor was called with no current row.
    #[error("no current row")]
    NoCurrentRow,

    /// Column index past the end of the row.
    #[error("column index {index} out of range ({count} columns)")]
    ColumnOutOfRange {
        /// Requested index.
        index: usize,
        /// Columns in the row.
        count: usize,
    },

    /// A typed accessor does not match the column's value.
    #[error("column {index}: cannot read {actual} as {expected}")]
    TypeMismatch {
        /// Column index.
        index: usize,
        /// Requested type.
        expected: &'static str,
        /// Type found in the row.
        actual: &'static str,
    },
}

impl Error {
    /// Build a server error from an ERROR token.
    #[must_use]
    pub fn from_server_message(msg: &ServerMessage) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self::Server {
            number: msg.number,
            class: msg.class,
            state: msg.state,
            message: msg.message.clone(),
            server: non_empty(&msg.server),
            procedure: non_empty(&msg.procedure),
            line: msg.line,
        }
    }

    /// Bytes that could not be decoded.
    #[must_use]
    pub fn is_parsing_fault(&self) -> bool {
        match self {
            Self::Protocol(err) => !is_sequence_error(err),
            Self::Codec(err) => match err {
                CodecError::Protocol(inner) => !is_sequence_error(inner),
                other => other.is_parsing_fault(),
            },
            _ => false,
        }
    }

    /// Well-formed bytes in an order the protocol does not allow.
    #[must_use]
    pub fn is_protocol_sequence_fault(&self) -> bool {
        match self {
            Self::Protocol(err) | Self::Codec(CodecError::Protocol(err)) => is_sequence_error(err),
            Self::LoginNotAcknowledged | Self::UnexpectedToken(_) => true,
            _ => false,
        }
    }

    /// A deadline expired.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_) | Self::CommandTimeout(_) | Self::AcquisitionTimeout(_)
        )
    }

    /// No capacity was available.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::SlotBusy | Self::AcquisitionTimeout(_))
    }

    /// The connection cannot serve further commands after this error.
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        if self.is_parsing_fault() || self.is_protocol_sequence_fault() {
            return true;
        }
        match self {
            Self::Io(_)
            | Self::ConnectionClosed
            | Self::EncryptionRequired
            | Self::SessionFaulted
            | Self::ConnectTimeout(_) => true,
            Self::Codec(err) => err.is_disconnect(),
            Self::Server { class, .. } => *class >= 20,
            _ => false,
        }
    }

    /// Retrying on a fresh slot or connection may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::SessionFaulted => true,
            Self::Codec(err) => err.is_disconnect(),
            // deadlock victim, lock timeout, login-time database unavailable
            Self::Server { number, .. } => matches!(number, 1205 | 1222 | 4060),
            other => other.is_timeout() || other.is_capacity(),
        }
    }

    /// Severity class of a server error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

fn is_sequence_error(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::TrailingBytes { .. }
            | ProtocolError::MissingDone
            | ProtocolError::MissingColumnMetadata(_)
    )
}
