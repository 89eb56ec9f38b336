//! Protocol session: one physical connection, its handshake and its IO.
//!
//! A session owns the two halves of a transport. The write half sits behind
//! a [`PacketWriter`] under an async lock so requests from different slots
//! are serialized whole. The read half sits behind a [`MessageReader`] under
//! a second lock that only the slot at the head of the
//! [`SlotQueue`] (or a drain of an abandoned slot) takes.
//!
//! Lock order is always reader, then writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tds_framing::{BufferPool, MessageReader, PacketWriter};
use tds_wire::{
    DEFAULT_PACKET_SIZE, EncryptionLevel, EnvChange, EnvChangeType, EnvChangeValue, Login7,
    MAX_PACKET_SIZE, MIN_PACKET_SIZE, PacketStatus, PacketType, PreLogin, ProtocolError, SqlBatch,
    TdsVersion, Token, TokenStream,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;

use crate::command::{Command, FlushMode};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::slot::{OperationSlot, SlotQueue, SlotTicket, Turn};

/// A byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed transport as returned by a [`Connector`](crate::Connector).
pub type BoxedTransport = Box<dyn Transport>;

type BoxedRead = ReadHalf<BoxedTransport>;
type BoxedWrite = WriteHalf<BoxedTransport>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, nothing sent.
    Connecting,
    /// PRELOGIN written.
    PreloginSent,
    /// PRELOGIN response accepted.
    PreloginAcked,
    /// LOGIN7 written.
    LoginSent,
    /// Logged in and accepting slots.
    Ready,
    /// A fatal error occurred; the session accepts nothing.
    Faulted,
    /// Closed by the owner.
    Closed,
}

impl SessionState {
    /// Whether the session can never become ready again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Faulted | Self::Closed)
    }
}

/// Server-side environment as reported during login and by later
/// ENVCHANGE tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnv {
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Negotiated packet size.
    pub packet_size: usize,
    /// Raw default collation.
    pub collation: Option<Bytes>,
    /// Open transaction descriptor, 0 outside a transaction.
    pub transaction_descriptor: u64,
    /// Protocol version acknowledged by the server.
    pub tds_version: Option<TdsVersion>,
    /// Server program name.
    pub server_name: Option<String>,
    /// Server program version.
    pub server_version: Option<String>,
}

struct WriteSide {
    packets: PacketWriter,
    io: BoxedWrite,
}

impl WriteSide {
    async fn flush(&mut self) -> Result<usize, Error> {
        Ok(self.packets.flush(&mut self.io).await?)
    }
}

/// State shared by a [`Session`] handle and every slot it hands out.
pub(crate) struct SessionShared {
    id: u64,
    config: SessionConfig,
    state: Mutex<SessionState>,
    env: Mutex<SessionEnv>,
    slots: SlotQueue,
    writer: tokio::sync::Mutex<WriteSide>,
    reader: tokio::sync::Mutex<MessageReader<BoxedRead>>,
    capacity: Arc<Notify>,
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("active", &self.slots.active())
            .finish_non_exhaustive()
    }
}

impl SessionShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn slots(&self) -> &SlotQueue {
        &self.slots
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        tracing::debug!(session = self.id, from = ?*state, to = ?next, "session state change");
        *state = next;
    }

    /// Move to `Faulted` and wake everyone waiting on this session.
    pub(crate) fn fault(&self, err: &Error) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = SessionState::Faulted;
        }
        tracing::warn!(session = self.id, error = %err, "session faulted");
        self.slots.close();
        self.capacity.notify_waiters();
    }

    fn faulted<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            self.fault(err);
        }
        result
    }

    /// Apply an ENVCHANGE to the session environment.
    pub(crate) fn apply_env_change(&self, change: &EnvChange) -> Result<(), Error> {
        let mut env = self.env.lock();
        match change.env_type {
            EnvChangeType::Database => {
                if let Some(name) = change.new_database() {
                    tracing::debug!(session = self.id, database = name, "database changed");
                    env.database = Some(name.to_string());
                }
            }
            EnvChangeType::Language => {
                if let EnvChangeValue::String(language) = &change.new_value {
                    env.language = Some(language.clone());
                }
            }
            EnvChangeType::SqlCollation => {
                if let EnvChangeValue::Binary(raw) = &change.new_value {
                    env.collation = Some(raw.clone());
                }
            }
            EnvChangeType::PacketSize => {
                if let Some(size) = change.new_packet_size() {
                    let size = size?;
                    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
                        return Err(ProtocolError::InvalidField {
                            field: "packet size",
                            value: size as u64,
                        }
                        .into());
                    }
                    tracing::debug!(session = self.id, packet_size = size, "packet size changed");
                    env.packet_size = size;
                }
            }
            EnvChangeType::BeginTransaction
            | EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction
            | EnvChangeType::DefectTransaction
            | EnvChangeType::TransactionEnded => {
                if let Some(descriptor) = change.transaction_descriptor() {
                    tracing::debug!(
                        session = self.id,
                        kind = ?change.env_type,
                        descriptor,
                        "transaction descriptor changed"
                    );
                    env.transaction_descriptor = descriptor;
                }
            }
            other => {
                tracing::trace!(session = self.id, env_type = ?other, "ignoring environment change");
            }
        }
        Ok(())
    }

    /// Serialize one request and queue it for reading.
    pub(crate) async fn write_command(
        &self,
        ticket: SlotTicket,
        command: &Command,
        mode: FlushMode,
    ) -> Result<u64, Error> {
        let mut writer = self.writer.lock().await;
        if !self.slots.is_open() || self.state() != SessionState::Ready {
            return Err(Error::SessionFaulted);
        }

        let (descriptor, packet_size) = {
            let env = self.env.lock();
            (env.transaction_descriptor, env.packet_size)
        };
        if writer.packets.packet_size() != packet_size {
            writer.packets.set_packet_size(packet_size)?;
        }

        let batch = SqlBatch::new(command.text()).with_transaction(descriptor, 1);
        writer
            .packets
            .write_with(PacketType::SqlBatch, command.packet_status(), |sink| {
                batch.encode(sink)
            })?;
        let seq = self.slots.push_written(ticket);
        tracing::debug!(
            session = self.id,
            slot = ticket.id,
            seq,
            mode = ?mode,
            pending_bytes = writer.packets.pending_len(),
            "command written"
        );

        if mode == FlushMode::Immediate {
            let flushed = writer.flush().await;
            let bytes = self.faulted(flushed)?;
            self.slots.mark_flushed(seq);
            tracing::trace!(session = self.id, bytes, "flushed after write");
        }
        Ok(seq)
    }

    /// Flush the writer unless everything up to `seq` is already out.
    async fn flush_through(&self, seq: u64) -> Result<(), Error> {
        if self.slots.flushed_seq() >= seq {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        if self.slots.flushed_seq() >= seq {
            return Ok(());
        }
        let upto = self.slots.written_seq();
        let flushed = writer.flush().await;
        let bytes = self.faulted(flushed)?;
        self.slots.mark_flushed(upto);
        tracing::debug!(session = self.id, bytes, through = upto, "flushed deferred requests");
        Ok(())
    }

    /// Read exactly one response message off the transport.
    async fn read_one(&self, reader: &mut MessageReader<BoxedRead>) -> Result<Bytes, Error> {
        let packet_size = self.env.lock().packet_size;
        if reader.max_packet_size() != packet_size {
            reader.set_max_packet_size(packet_size);
        }
        let result = match reader.read_message(PacketType::TabularResult).await {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(err) => Err(err.into()),
        };
        self.faulted(result)
    }

    /// Wait until `ticket` is at the head of the read queue, then read its
    /// response.
    pub(crate) async fn read_response(
        self: &Arc<Self>,
        ticket: SlotTicket,
        seq: u64,
    ) -> Result<Bytes, Error> {
        loop {
            let notified = self.slots.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.slots.turn(ticket) {
                Turn::Ready => break,
                Turn::Drain(head, head_seq) => self.drain_one(head, head_seq).await?,
                Turn::Wait => notified.await,
                Turn::Closed => return Err(Error::SessionFaulted),
            }
        }

        let mut reader = self.reader.lock().await;
        if self.slots.turn(ticket) != Turn::Ready {
            return Err(Error::SessionFaulted);
        }
        self.flush_through(seq).await?;
        let payload = self.read_one(&mut reader).await?;
        self.slots.complete(ticket);
        drop(reader);

        tracing::debug!(
            session = self.id,
            slot = ticket.id,
            bytes = payload.len(),
            "response read"
        );
        self.capacity.notify_waiters();
        self.schedule_drain();
        Ok(payload)
    }

    /// Read and discard the response of an abandoned slot at the head.
    async fn drain_one(&self, ticket: SlotTicket, seq: u64) -> Result<(), Error> {
        let mut reader = self.reader.lock().await;
        if self.slots.abandoned_head().map(|(head, _)| head) != Some(ticket) {
            // someone else drained it first
            return Ok(());
        }
        self.flush_through(seq).await?;
        let payload = self.read_one(&mut reader).await?;
        self.slots.complete(ticket);
        drop(reader);

        tracing::warn!(
            session = self.id,
            slot = ticket.id,
            bytes = payload.len(),
            "drained abandoned response"
        );
        self.capacity.notify_waiters();
        Ok(())
    }

    /// Drain abandoned responses at the head of the queue.
    pub(crate) async fn drain_abandoned(&self) -> Result<usize, Error> {
        let mut drained = 0;
        while let Some((ticket, seq)) = self.slots.abandoned_head() {
            self.drain_one(ticket, seq).await?;
            drained += 1;
        }
        Ok(drained)
    }

    /// Drain in the background if an abandoned response blocks the queue.
    fn schedule_drain(self: &Arc<Self>) {
        if self.slots.abandoned_head().is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // the next reader drains it instead
            return;
        };
        let session = Arc::clone(self);
        handle.spawn(async move {
            if let Err(err) = session.drain_abandoned().await {
                tracing::debug!(session = session.id, error = %err, "background drain failed");
            }
        });
    }

    /// Cancel a slot; queued requests are left for draining.
    pub(crate) fn abandon_slot(self: &Arc<Self>, ticket: SlotTicket) {
        if self.slots.abandon(ticket) {
            tracing::debug!(session = self.id, slot = ticket.id, "slot abandoned");
            self.schedule_drain();
        } else {
            tracing::trace!(session = self.id, slot = ticket.id, "slot released");
            self.capacity.notify_waiters();
        }
    }

    async fn send_handshake<F>(&self, packet_type: PacketType, encode: F) -> Result<(), Error>
    where
        F: FnOnce(&mut PacketWriter) -> Result<(), ProtocolError>,
    {
        let mut writer = self.writer.lock().await;
        writer
            .packets
            .write_with(packet_type, PacketStatus::NORMAL, encode)?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake(&self) -> Result<Bytes, Error> {
        let mut reader = self.reader.lock().await;
        match reader.read_message(PacketType::TabularResult).await? {
            Some(message) => Ok(message.payload),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn handshake(&self) -> Result<(), Error> {
        let config = &self.config;

        tracing::debug!(session = self.id, "sending PreLogin");
        let prelogin = PreLogin::new().with_encryption(EncryptionLevel::NotSupported);
        self.send_handshake(PacketType::PreLogin, |sink| prelogin.encode(sink))
            .await?;
        self.transition(SessionState::PreloginSent);

        let response = PreLogin::decode(self.read_handshake().await?)?;
        tracing::debug!(
            session = self.id,
            server_version = response.version,
            encryption = ?response.encryption,
            "PreLogin response received"
        );
        if response.encryption.demands_tls() {
            return Err(Error::EncryptionRequired);
        }
        self.transition(SessionState::PreloginAcked);

        let packet_size = u32::try_from(config.packet_size)
            .map_err(|_| Error::Config("packet_size does not fit in u32".into()))?;
        let mut login = Login7::new()
            .with_sql_auth(&config.username, &config.password)
            .with_hostname(&config.client_host)
            .with_app_name(&config.application_name)
            .with_server_name(&config.host)
            .with_packet_size(packet_size);
        login.tds_version = config.tds_version;
        if let Some(database) = &config.database {
            login = login.with_database(database);
        }

        tracing::debug!(session = self.id, username = %config.username, "sending Login7");
        self.send_handshake(PacketType::Tds7Login, |sink| login.encode(sink))
            .await?;
        self.transition(SessionState::LoginSent);

        let payload = self.read_handshake().await?;
        self.process_login_response(payload)?;

        let packet_size = self.env.lock().packet_size;
        self.writer.lock().await.packets.set_packet_size(packet_size)?;
        self.reader.lock().await.set_max_packet_size(packet_size);

        self.transition(SessionState::Ready);
        Ok(())
    }

    fn process_login_response(&self, payload: Bytes) -> Result<(), Error> {
        let mut stream = TokenStream::with_policy(payload, self.config.unknown_token_policy);
        let mut ack = None;
        let mut server_error = None;

        while let Some(token) = stream.next_token()? {
            match token {
                Token::LoginAck(login_ack) => ack = Some(login_ack),
                Token::EnvChange(change) => self.apply_env_change(&change)?,
                Token::Error(msg) => {
                    tracing::error!(
                        session = self.id,
                        number = msg.number,
                        class = msg.class,
                        message = %msg.message,
                        "login failed"
                    );
                    server_error.get_or_insert_with(|| Error::from_server_message(&msg));
                }
                Token::Info(msg) => {
                    tracing::debug!(session = self.id, number = msg.number, message = %msg.message, "login info");
                }
                Token::Row(_) => return Err(Error::UnexpectedToken("ROW")),
                other => {
                    tracing::trace!(session = self.id, token = ?other, "login token");
                }
            }
        }

        if let Some(err) = server_error {
            return Err(err);
        }
        let ack = ack.ok_or(Error::LoginNotAcknowledged)?;

        let mut env = self.env.lock();
        env.tds_version = Some(ack.tds_version);
        env.server_name = Some(ack.prog_name.clone());
        env.server_version = Some(ack.server_version());
        tracing::info!(
            session = self.id,
            server = %ack.prog_name,
            version = %ack.server_version(),
            tds_version = ?ack.tds_version,
            database = ?env.database,
            packet_size = env.packet_size,
            "login acknowledged"
        );
        Ok(())
    }
}

/// One physical connection and its protocol state.
///
/// Cloning yields another handle to the same session.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Wrap a connected transport. Nothing is sent until [`start`](Self::start).
    ///
    /// `capacity` is notified whenever a slot is released or the session
    /// faults, so a pool can wake waiting acquirers.
    pub fn new<T: Transport>(
        transport: T,
        config: SessionConfig,
        buffers: BufferPool,
        capacity: Arc<Notify>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let boxed: BoxedTransport = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        let packets = PacketWriter::new(buffers, DEFAULT_PACKET_SIZE)?;

        let shared = SessionShared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            slots: SlotQueue::new(config.pipeline_depth),
            env: Mutex::new(SessionEnv {
                database: config.database.clone(),
                packet_size: DEFAULT_PACKET_SIZE,
                ..SessionEnv::default()
            }),
            config,
            state: Mutex::new(SessionState::Connecting),
            writer: tokio::sync::Mutex::new(WriteSide {
                packets,
                io: write_half,
            }),
            reader: tokio::sync::Mutex::new(MessageReader::with_max_packet_size(
                read_half,
                MAX_PACKET_SIZE,
            )),
            capacity,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Run PRELOGIN and LOGIN7.
    ///
    /// Any failure, including the connect timeout, leaves the session
    /// `Faulted`.
    pub async fn start(&self) -> Result<(), Error> {
        let state = self.state();
        if state != SessionState::Connecting {
            return Err(Error::SessionNotReady(state));
        }
        let limit = self.shared.config.connect_timeout;
        let result = match tokio::time::timeout(limit, self.shared.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout(limit)),
        };
        self.shared.faulted(result)
    }

    /// Process-unique session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether the session is faulted or closed.
    #[must_use]
    pub fn is_defunct(&self) -> bool {
        self.state().is_terminal()
    }

    /// Snapshot of the server environment.
    #[must_use]
    pub fn env(&self) -> SessionEnv {
        self.shared.env.lock().clone()
    }

    /// Configuration this session was created with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Reserve a slot without waiting.
    ///
    /// Fails with [`Error::SlotBusy`] when the session is at its pipeline
    /// depth or the exclusivity rules forbid the reservation.
    pub fn try_start_operation(&self, exclusive: bool) -> Result<OperationSlot, Error> {
        match self.state() {
            SessionState::Ready => {}
            SessionState::Faulted | SessionState::Closed => return Err(Error::SessionFaulted),
            other => return Err(Error::SessionNotReady(other)),
        }
        let ticket = self.shared.slots.try_reserve(exclusive)?;
        tracing::trace!(session = self.id(), slot = ticket.id, exclusive, "slot reserved");
        Ok(OperationSlot::new(Arc::clone(&self.shared), ticket))
    }

    /// Whether [`try_start_operation`](Self::try_start_operation) would
    /// currently succeed.
    #[must_use]
    pub fn has_room(&self, exclusive: bool) -> bool {
        self.state() == SessionState::Ready && self.shared.slots.has_room(exclusive)
    }

    /// Reserved or in-flight slots.
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.shared.slots.active()
    }

    /// Written requests whose responses have not been read.
    #[must_use]
    pub fn pending_reads(&self) -> usize {
        self.shared.slots.pending_reads()
    }

    /// Maximum concurrent slots.
    #[must_use]
    pub fn pipeline_depth(&self) -> usize {
        self.shared.slots.depth()
    }

    /// Read and discard every abandoned response at the head of the queue.
    ///
    /// Returns how many were drained. A failure faults the session.
    pub async fn drain_abandoned(&self) -> Result<usize, Error> {
        self.shared.drain_abandoned().await
    }

    /// Close the session and shut the transport down.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.shared.slots.close();
        self.shared.capacity.notify_waiters();

        let mut writer = self.shared.writer.lock().await;
        writer.packets.discard();
        if let Err(err) = writer.io.shutdown().await {
            tracing::debug!(session = self.id(), error = %err, "transport shutdown failed");
        }
        tracing::debug!(session = self.id(), "session closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> Session {
        let (client, _server) = tokio::io::duplex(1024);
        Session::new(
            client,
            SessionConfig::default(),
            BufferPool::default(),
            Arc::new(Notify::new()),
        )
        .unwrap()
    }

    fn env_change(env_type: EnvChangeType, new_value: EnvChangeValue) -> EnvChange {
        EnvChange {
            env_type,
            new_value,
            old_value: EnvChangeValue::Binary(Bytes::new()),
        }
    }

    #[tokio::test]
    async fn test_new_session_is_not_ready() {
        let session = session();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(matches!(
            session.try_start_operation(false),
            Err(Error::SessionNotReady(SessionState::Connecting))
        ));
        assert!(!session.has_room(false));
    }

    #[tokio::test]
    async fn test_env_changes_update_session_env() {
        let session = session();
        let shared = &session.shared;

        shared
            .apply_env_change(&env_change(
                EnvChangeType::Database,
                EnvChangeValue::String("orders".into()),
            ))
            .unwrap();
        shared
            .apply_env_change(&env_change(
                EnvChangeType::PacketSize,
                EnvChangeValue::String("8192".into()),
            ))
            .unwrap();
        shared
            .apply_env_change(&env_change(
                EnvChangeType::BeginTransaction,
                EnvChangeValue::Binary(Bytes::copy_from_slice(&7u64.to_le_bytes())),
            ))
            .unwrap();

        let env = session.env();
        assert_eq!(env.database.as_deref(), Some("orders"));
        assert_eq!(env.packet_size, 8192);
        assert_eq!(env.transaction_descriptor, 7);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_packet_size() {
        let session = session();
        let err = session
            .shared
            .apply_env_change(&env_change(
                EnvChangeType::PacketSize,
                EnvChangeValue::String("100".into()),
            ))
            .unwrap_err();
        assert!(err.is_parsing_fault());
        assert_eq!(session.env().packet_size, DEFAULT_PACKET_SIZE);
    }

    #[tokio::test]
    async fn test_fault_is_sticky() {
        let session = session();
        session.shared.fault(&Error::ConnectionClosed);
        assert_eq!(session.state(), SessionState::Faulted);

        session.shared.transition(SessionState::Ready);
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(matches!(
            session.try_start_operation(false),
            Err(Error::SessionFaulted)
        ));
        assert!(matches!(session.start().await, Err(Error::SessionNotReady(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_defunct());
    }
}
