//! Mock TDS server for driver tests.
//!
//! The server speaks just enough of the protocol to drive a client through
//! PRELOGIN and LOGIN7 and answer SQL batches from a script. It reads and
//! writes through the same framing layer the client uses, so anything it
//! receives has passed header validation.
//!
//! ## Features
//!
//! - Scripted responses keyed by SQL text, with a default for the rest
//! - Delayed, malformed and disconnecting responses
//! - Login rejection and encryption demands
//! - In-memory connections over `tokio::io::duplex` or real TCP
//! - Recording of every batch and login received
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::{MockResponse, MockServer};
//!
//! let server = MockServer::builder()
//!     .with_response("SELECT 1", MockResponse::scalar_int(1))
//!     .build()
//!     .await?;
//!
//! let stream = server.connect_duplex();
//! // hand `stream` to the client under test
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tds_framing::{BufferPool, CodecError, MessageReader, PacketWriter};
use tds_wire::sql_batch::decode_sql_batch;
use tds_wire::{
    DEFAULT_PACKET_SIZE, DoneStatus, EncryptionLevel, EnvChangeType, Login7, PacketStatus,
    PacketType, PreLogin, ProtocolError, TdsVersion,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{Notify, broadcast};

use crate::tokens::{MockColumn, ScalarValue, TokenWriter};

/// Buffer size of each in-memory connection.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Server version reported in PRELOGIN and LOGINACK (16.0.4085).
const SERVER_VERSION: u32 = 0x1000_0FF5;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed client message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Handler computing a response from the batch that triggered it.
pub type ResponseFn = Arc<dyn Fn(&RecordedBatch) -> MockResponse + Send + Sync>;

/// What the server sends back for one batch.
#[derive(Clone)]
pub enum MockResponse {
    /// One row with one column.
    Scalar(ScalarValue),

    /// A result set.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// Row count only (INSERT/UPDATE/DELETE).
    RowsAffected(u64),

    /// A failed statement.
    Error {
        /// Error number.
        number: i32,
        /// Severity class.
        class: u8,
        /// Message text.
        message: String,
    },

    /// Several statements in one response, each but the last flagged MORE.
    Sequence(Vec<MockResponse>),

    /// Pre-encoded token stream, framed as-is.
    Raw(Bytes),

    /// Bytes written to the socket without any framing.
    RawWire(Bytes),

    /// Wait before answering.
    Delayed(Duration, Box<MockResponse>),

    /// Close the connection instead of answering.
    Disconnect,

    /// Compute the response from the batch.
    Custom(ResponseFn),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", &rows.len())
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::Error {
                number,
                class,
                message,
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("class", class)
                .field("message", message)
                .finish(),
            Self::Sequence(parts) => f.debug_tuple("Sequence").field(parts).finish(),
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::RawWire(data) => f.debug_tuple("RawWire").field(&data.len()).finish(),
            Self::Delayed(delay, inner) => f.debug_tuple("Delayed").field(delay).field(inner).finish(),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Single `int` value.
    pub fn scalar_int(value: i32) -> Self {
        Self::Scalar(ScalarValue::Int(value))
    }

    /// Single `nvarchar` value.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::Scalar(ScalarValue::String(value.into()))
    }

    /// Statement with no rows and no count.
    pub fn empty() -> Self {
        Self::Raw(TokenWriter::new().done(DoneStatus::empty(), 0).finish())
    }

    /// Row count.
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Statement failing with severity 16.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            class: 16,
            message: message.into(),
        }
    }

    /// Result set.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Start a transaction with `descriptor`.
    pub fn begin_transaction(descriptor: u64) -> Self {
        Self::Raw(
            TokenWriter::new()
                .begin_transaction(descriptor)
                .done(DoneStatus::empty(), 0)
                .finish(),
        )
    }

    /// Commit transaction `descriptor`.
    pub fn commit_transaction(descriptor: u64) -> Self {
        Self::Raw(
            TokenWriter::new()
                .commit_transaction(descriptor)
                .done(DoneStatus::empty(), 0)
                .finish(),
        )
    }

    /// Compute the response per batch.
    pub fn custom(handler: impl Fn(&RecordedBatch) -> MockResponse + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(handler))
    }

    /// Send this response after `delay`.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    /// Encode as one statement of a response.
    fn encode(&self, tokens: &mut TokenWriter, more: bool, batch: &RecordedBatch, server: &str) {
        let more_bit = if more { DoneStatus::MORE } else { DoneStatus::empty() };
        match self {
            Self::Scalar(value) => {
                let columns = [value.column("")];
                tokens
                    .col_metadata(&columns)
                    .row(&columns, std::slice::from_ref(value))
                    .done(DoneStatus::COUNT | more_bit, 1);
            }
            Self::Rows { columns, rows } => {
                tokens.col_metadata(columns);
                for row in rows {
                    tokens.row(columns, row);
                }
                tokens.done(DoneStatus::COUNT | more_bit, rows.len() as u64);
            }
            Self::RowsAffected(count) => {
                tokens.done(DoneStatus::COUNT | more_bit, *count);
            }
            Self::Error {
                number,
                class,
                message,
            } => {
                tokens
                    .error(*number, *class, message, server)
                    .done(DoneStatus::ERROR | more_bit, 0);
            }
            Self::Sequence(parts) => {
                let last = parts.len().saturating_sub(1);
                for (i, part) in parts.iter().enumerate() {
                    part.encode(tokens, more || i < last, batch, server);
                }
            }
            Self::Raw(data) => {
                tokens.raw(data);
            }
            Self::Delayed(_, inner) => inner.encode(tokens, more, batch, server),
            Self::Custom(handler) => handler(batch).encode(tokens, more, batch, server),
            Self::RawWire(_) | Self::Disconnect => {
                tracing::warn!(response = ?self, "response kind ignored inside a sequence");
            }
        }
    }
}

/// How the server answers LOGIN7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginBehavior {
    /// Acknowledge the login.
    Accept,
    /// Fail the login with an error token.
    Reject {
        /// Error number.
        number: i32,
        /// Message text.
        message: String,
    },
    /// End the response without a LOGINACK.
    NoAck,
}

/// A SQL batch as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    /// Connection the batch arrived on, numbered from 1.
    pub connection: usize,
    /// SQL text.
    pub sql: String,
    /// Transaction descriptor from the request headers.
    pub transaction_descriptor: Option<u64>,
    /// Packets the batch was split into.
    pub packet_count: usize,
}

/// A LOGIN7 as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLogin {
    /// Connection the login arrived on.
    pub connection: usize,
    /// SQL login name.
    pub username: String,
    /// Requested database.
    pub database: String,
    /// Application name.
    pub app_name: String,
    /// Requested packet size.
    pub packet_size: u32,
    /// Requested protocol version.
    pub tds_version: TdsVersion,
}

/// Mock server configuration.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Server name used in LOGINACK and error tokens.
    pub server_name: String,
    /// Database reported after login.
    pub database: String,
    /// Encryption level answered in PRELOGIN.
    pub encryption: EncryptionLevel,
    /// Packet size imposed after login, instead of the client's request.
    pub packet_size: Option<usize>,
    /// Protocol version acknowledged.
    pub tds_version: TdsVersion,
    /// LOGIN7 handling.
    pub login: LoginBehavior,
    /// Scripted responses by normalized SQL.
    pub responses: HashMap<String, MockResponse>,
    /// Response for unscripted SQL.
    pub default_response: MockResponse,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            server_name: "MockServer".into(),
            database: "master".into(),
            encryption: EncryptionLevel::NotSupported,
            packet_size: None,
            tds_version: TdsVersion::V7_4,
            login: LoginBehavior::Accept,
            responses: HashMap::new(),
            default_response: MockResponse::empty(),
        }
    }
}

impl MockServerConfig {
    fn find_response(&self, sql: &str) -> MockResponse {
        self.responses
            .get(&normalize(sql))
            .unwrap_or(&self.default_response)
            .clone()
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Builder for [`MockServer`].
#[derive(Debug, Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with `response`. Matching ignores case and whitespace runs.
    #[must_use]
    pub fn with_response(mut self, sql: impl AsRef<str>, response: MockResponse) -> Self {
        self.config.responses.insert(normalize(sql.as_ref()), response);
        self
    }

    /// Response for SQL without a scripted answer.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Server name.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Database reported after login.
    #[must_use]
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Encryption level answered in PRELOGIN.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// Impose a packet size after login.
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = Some(size);
        self
    }

    /// LOGIN7 handling.
    #[must_use]
    pub fn with_login(mut self, login: LoginBehavior) -> Self {
        self.config.login = login;
        self
    }

    /// Start listening.
    pub async fn build(self) -> Result<MockServer> {
        MockServer::start(self.config).await
    }
}

#[derive(Default)]
struct Recorded {
    batches: Mutex<Vec<RecordedBatch>>,
    logins: Mutex<Vec<RecordedLogin>>,
    attentions: AtomicUsize,
    connections: AtomicUsize,
    activity: Notify,
}

struct Shared {
    config: MockServerConfig,
    recorded: Recorded,
    shutdown: broadcast::Sender<()>,
}

/// A running mock server.
///
/// Listens on `127.0.0.1` on an ephemeral port and also accepts in-memory
/// connections through [`connect_duplex`](Self::connect_duplex). Every
/// connection is served on its own task and closed on [`stop`](Self::stop)
/// or drop.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockServer")
            .field("addr", &self.addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl MockServer {
    /// Builder for a new server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start a server with `config`.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            config,
            recorded: Recorded::default(),
            shutdown,
        });

        let accept = Arc::clone(&shared);
        let mut shutdown_rx = shared.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "mock server accepted connection");
                            let _ = stream.set_nodelay(true);
                            spawn_connection(&accept, stream);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "mock server accept failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        tracing::info!(%addr, "mock server listening");
        Ok(Self { addr, shared })
    }

    /// Open an in-memory connection and return the client end.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect_duplex(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        spawn_connection(&self.shared, server);
        client
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening host.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far, over TCP or in memory.
    pub fn connection_count(&self) -> usize {
        self.shared.recorded.connections.load(Ordering::Acquire)
    }

    /// Batches received so far, in arrival order.
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.shared.recorded.batches.lock().clone()
    }

    /// Number of batches received so far.
    pub fn batch_count(&self) -> usize {
        self.shared.recorded.batches.lock().len()
    }

    /// Logins received so far.
    pub fn logins(&self) -> Vec<RecordedLogin> {
        self.shared.recorded.logins.lock().clone()
    }

    /// Attention signals received so far.
    pub fn attention_count(&self) -> usize {
        self.shared.recorded.attentions.load(Ordering::Acquire)
    }

    /// Wait until at least `count` batches have arrived.
    pub async fn wait_for_batches(&self, count: usize) {
        loop {
            let notified = self.shared.recorded.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.batch_count() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&self) {
        let _ = self.shared.shutdown.send(());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_connection<S>(shared: &Arc<Shared>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connection = shared.recorded.connections.fetch_add(1, Ordering::AcqRel) + 1;
    let shared = Arc::clone(shared);
    let mut shutdown_rx = shared.shutdown.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            served = serve(stream, &shared, connection) => {
                if let Err(err) = served {
                    tracing::debug!(connection, error = %err, "mock connection ended with error");
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!(connection, "mock connection closed by shutdown");
            }
        }
    });
}

async fn serve<S>(stream: S, shared: &Shared, connection: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &shared.config;
    let (read_half, mut io) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read_half);
    let mut writer = PacketWriter::new(BufferPool::default(), DEFAULT_PACKET_SIZE)?;

    // PRELOGIN
    let Some(message) = reader.read_message(PacketType::PreLogin).await? else {
        return Ok(());
    };
    let request = PreLogin::decode(message.payload)?;
    tracing::debug!(connection, encryption = ?request.encryption, "mock server received PRELOGIN");
    let response = PreLogin {
        version: SERVER_VERSION,
        encryption: config.encryption,
        ..PreLogin::default()
    };
    writer.write_with(PacketType::TabularResult, PacketStatus::NORMAL, |sink| {
        response.encode(sink)
    })?;
    writer.flush(&mut io).await?;
    if config.encryption.demands_tls() {
        // a TLS handshake would follow; the mock stops here
        return Ok(());
    }

    // LOGIN7
    let Some(message) = reader.read_message(PacketType::Tds7Login).await? else {
        return Ok(());
    };
    let login = Login7::decode(message.payload)?;
    shared.recorded.logins.lock().push(RecordedLogin {
        connection,
        username: login.username.clone(),
        database: login.database.clone(),
        app_name: login.app_name.clone(),
        packet_size: login.packet_size,
        tds_version: login.tds_version,
    });
    let packet_size = config.packet_size.unwrap_or(login.packet_size as usize);
    let tokens = login_response(config, &login, packet_size);
    writer.write_message(PacketType::TabularResult, PacketStatus::NORMAL, &tokens)?;
    writer.flush(&mut io).await?;
    if config.login != LoginBehavior::Accept {
        return Ok(());
    }
    writer.set_packet_size(packet_size)?;
    reader.set_max_packet_size(packet_size);
    tracing::debug!(connection, username = %login.username, packet_size, "mock login accepted");

    // batches
    while let Some(message) = reader.read_any_message().await? {
        match message.packet_type {
            PacketType::SqlBatch => {
                let (transaction_descriptor, sql) = decode_sql_batch(&message.payload)?;
                let batch = RecordedBatch {
                    connection,
                    sql,
                    transaction_descriptor,
                    packet_count: message.packet_count,
                };
                tracing::trace!(connection, sql = %batch.sql, "mock server received batch");
                shared.recorded.batches.lock().push(batch.clone());
                shared.recorded.activity.notify_waiters();

                let response = config.find_response(&batch.sql);
                if !respond(&mut writer, &mut io, response, &batch, config).await? {
                    break;
                }
            }
            PacketType::Attention => {
                shared.recorded.attentions.fetch_add(1, Ordering::AcqRel);
                shared.recorded.activity.notify_waiters();
                let tokens = TokenWriter::new().done(DoneStatus::ATTN, 0).finish();
                writer.write_message(PacketType::TabularResult, PacketStatus::NORMAL, &tokens)?;
                writer.flush(&mut io).await?;
            }
            other => {
                tracing::warn!(connection, packet_type = ?other, "mock server ignoring message");
            }
        }
    }
    Ok(())
}

fn login_response(config: &MockServerConfig, login: &Login7, packet_size: usize) -> Bytes {
    let mut tokens = TokenWriter::new();
    match &config.login {
        LoginBehavior::Accept | LoginBehavior::NoAck => {
            let database = if login.database.is_empty() {
                &config.database
            } else {
                &login.database
            };
            tokens
                .env_change(EnvChangeType::Database, database, "master")
                .env_change(
                    EnvChangeType::PacketSize,
                    &packet_size.to_string(),
                    &DEFAULT_PACKET_SIZE.to_string(),
                );
            if config.login == LoginBehavior::Accept {
                let version = config.tds_version.min(login.tds_version);
                tokens.login_ack(version, &config.server_name, SERVER_VERSION);
            }
            tokens.done(DoneStatus::empty(), 0);
        }
        LoginBehavior::Reject { number, message } => {
            tokens
                .error(*number, 14, message, &config.server_name)
                .done(DoneStatus::ERROR, 0);
        }
    }
    tokens.finish()
}

/// Send one response. Returns `false` when the connection should close.
async fn respond<W>(
    writer: &mut PacketWriter,
    io: &mut W,
    response: MockResponse,
    batch: &RecordedBatch,
    config: &MockServerConfig,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let mut response = response;
    loop {
        match response {
            MockResponse::Custom(handler) => response = handler(batch),
            MockResponse::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                response = *inner;
            }
            MockResponse::Disconnect => return Ok(false),
            MockResponse::RawWire(bytes) => {
                io.write_all(&bytes).await?;
                io.flush().await?;
                return Ok(true);
            }
            other => {
                let mut tokens = TokenWriter::new();
                other.encode(&mut tokens, false, batch, &config.server_name);
                writer.write_message(PacketType::TabularResult, PacketStatus::NORMAL, &tokens.finish())?;
                writer.flush(io).await?;
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ignores_case_and_spacing() {
        assert_eq!(normalize("  select\n  1 "), "SELECT 1");
        assert_eq!(normalize("SELECT 1"), normalize("select   1"));
    }

    #[test]
    fn test_find_response_falls_back_to_default() {
        let config = MockServerBuilder::new()
            .with_response("SELECT 1", MockResponse::scalar_int(1))
            .with_default_response(MockResponse::affected(3))
            .config;
        assert!(matches!(
            config.find_response("select 1"),
            MockResponse::Scalar(ScalarValue::Int(1))
        ));
        assert!(matches!(
            config.find_response("DELETE FROM t"),
            MockResponse::RowsAffected(3)
        ));
    }

    #[test]
    fn test_rejected_login_has_error_and_no_ack() {
        let config = MockServerConfig {
            login: LoginBehavior::Reject {
                number: 18456,
                message: "Login failed".into(),
            },
            ..MockServerConfig::default()
        };
        let payload = login_response(&config, &Login7::new(), 4096);
        assert_eq!(payload[0], 0xAA);
        // ERROR followed by a DONE with the error bit
        let done = &payload[payload.len() - 13..];
        assert_eq!(done[0], 0xFD);
        assert_eq!(u16::from_le_bytes([done[1], done[2]]), DoneStatus::ERROR.bits());
    }

    #[test]
    fn test_sequence_flags_all_but_last() {
        let response = MockResponse::Sequence(vec![
            MockResponse::affected(1),
            MockResponse::affected(2),
        ]);
        let batch = RecordedBatch {
            connection: 1,
            sql: String::new(),
            transaction_descriptor: None,
            packet_count: 1,
        };
        let mut tokens = TokenWriter::new();
        response.encode(&mut tokens, false, &batch, "s");
        let payload = tokens.finish();
        assert_eq!(payload.len(), 26);
        let first = u16::from_le_bytes([payload[1], payload[2]]);
        let second = u16::from_le_bytes([payload[14], payload[15]]);
        assert_eq!(first, (DoneStatus::COUNT | DoneStatus::MORE).bits());
        assert_eq!(second, DoneStatus::COUNT.bits());
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let server = MockServer::builder().build().await.unwrap();
        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.connection_count(), 0);
        let _client = server.connect_duplex();
        assert_eq!(server.connection_count(), 1);
        server.stop();
    }
}
