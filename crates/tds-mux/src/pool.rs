//! Connection pool and slot dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tds_framing::{BufferPool, PoolStats};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::command::{Command, FlushMode};
use crate::config::{PoolConfig, SessionConfig};
use crate::error::Error;
use crate::session::{BoxedTransport, Session};
use crate::slot::{CommandExecution, OperationSlot};

/// Opens transports for new sessions.
///
/// Object-safe so a pool can hold any connector behind `Arc<dyn Connector>`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport to the server described by `config`.
    async fn connect(&self, config: &SessionConfig) -> Result<BoxedTransport, Error>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<BoxedTransport, Error> {
        let limit = config.connect_timeout;
        let stream = tokio::time::timeout(limit, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| Error::ConnectTimeout(limit))??;
        stream.set_nodelay(true)?;
        tracing::debug!(host = %config.host, port = config.port, "TCP connection established");
        Ok(Box::new(stream))
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Ready sessions.
    pub sessions: usize,
    /// Sessions currently being established.
    pub opening: usize,
    /// Maximum allowed sessions.
    pub max: usize,
    /// Reserved or in-flight slots across all sessions.
    pub active_slots: usize,
    /// Written requests awaiting their responses.
    pub pending_reads: usize,
    /// Sessions opened over the pool's lifetime.
    pub sessions_opened: u64,
    /// Acquisitions that timed out.
    pub acquire_timeouts: u64,
    /// Shared buffer pool counters.
    pub buffers: PoolStats,
}

#[derive(Debug, Default)]
struct Members {
    sessions: Vec<Session>,
    opening: usize,
}

struct PoolInner {
    config: PoolConfig,
    session_config: SessionConfig,
    connector: Arc<dyn Connector>,
    buffers: BufferPool,
    capacity: Arc<Notify>,
    members: Mutex<Members>,
    closed: AtomicBool,
    sessions_opened: AtomicU64,
    acquire_timeouts: AtomicU64,
}

/// Decrements the opening count however session setup ends.
struct OpeningGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.inner.members.lock().opening -= 1;
        self.inner.capacity.notify_waiters();
    }
}

/// A set of sessions to one server, handing out operation slots.
///
/// Sessions are opened lazily on demand up to
/// [`PoolConfig::max_connections`]. A non-exclusive slot goes to the first
/// ready session with room, so many commands share one connection before a
/// new one is opened. Faulted sessions are dropped from the pool the next
/// time it is scanned.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("session_config", &self.inner.session_config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a pool. No connection is opened until a slot is requested.
    pub fn new(
        config: PoolConfig,
        session_config: SessionConfig,
        connector: impl Connector,
    ) -> Result<Self, Error> {
        config.validate()?;
        session_config.validate()?;
        let buffers = BufferPool::new(config.buffer_pool_capacity, config.segment_size);
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                session_config,
                connector: Arc::new(connector),
                buffers,
                capacity: Arc::new(Notify::new()),
                members: Mutex::new(Members::default()),
                closed: AtomicBool::new(false),
                sessions_opened: AtomicU64::new(0),
                acquire_timeouts: AtomicU64::new(0),
            }),
        })
    }

    /// Get a slot, opening a session if every existing one is full.
    ///
    /// Waits up to `timeout` for capacity, then fails with
    /// [`Error::AcquisitionTimeout`]. Errors from opening a session are
    /// returned as they are.
    pub async fn get_slot(&self, exclusive: bool, timeout: Duration) -> Result<OperationSlot, Error> {
        let deadline = Instant::now() + timeout;
        let inner = &*self.inner;

        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            let notified = inner.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let grow = {
                let mut members = inner.members.lock();
                members.sessions.retain(|session| {
                    let keep = !session.is_defunct();
                    if !keep {
                        tracing::debug!(session = session.id(), "pruning defunct session");
                    }
                    keep
                });
                if let Some(slot) = members
                    .sessions
                    .iter()
                    .find_map(|session| session.try_start_operation(exclusive).ok())
                {
                    return Ok(slot);
                }
                let room = members.sessions.len() + members.opening < inner.config.max_connections;
                if room {
                    members.opening += 1;
                }
                room
            };

            if grow {
                let guard = OpeningGuard { inner };
                let session = match tokio::time::timeout_at(deadline, self.open_session()).await {
                    Ok(opened) => opened?,
                    Err(_) => return Err(self.acquire_timeout(timeout)),
                };
                let slot = session.try_start_operation(exclusive);
                inner.members.lock().sessions.push(session);
                drop(guard);
                match slot {
                    Ok(slot) => return Ok(slot),
                    Err(_) => continue,
                }
            }

            tracing::trace!(exclusive, "waiting for slot capacity");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.acquire_timeout(timeout));
            }
        }
    }

    /// Write `command` on a shared slot and flush it.
    ///
    /// Uses the pool's default acquire timeout.
    pub async fn write_multiplexing_command(
        &self,
        command: &Command,
    ) -> Result<CommandExecution, Error> {
        let slot = self
            .get_slot(false, self.inner.config.acquire_timeout)
            .await?;
        slot.write(command, FlushMode::Immediate).await
    }

    /// Current statistics.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let members = self.inner.members.lock();
        let live = members.sessions.iter().filter(|s| !s.is_defunct());
        let (sessions, active_slots, pending_reads) = live.fold((0, 0, 0), |(n, a, p), s| {
            (n + 1, a + s.active_slots(), p + s.pending_reads())
        });
        PoolStatus {
            sessions,
            opening: members.opening,
            max: self.inner.config.max_connections,
            active_slots,
            pending_reads,
            sessions_opened: self.inner.sessions_opened.load(Ordering::Relaxed),
            acquire_timeouts: self.inner.acquire_timeouts.load(Ordering::Relaxed),
            buffers: self.inner.buffers.stats(),
        }
    }

    /// Close every session and reject further requests.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = std::mem::take(&mut self.inner.members.lock().sessions);
        for session in &sessions {
            session.close().await;
        }
        self.inner.capacity.notify_waiters();
        tracing::info!(sessions = sessions.len(), "pool closed");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Configuration used for every session.
    #[must_use]
    pub fn session_config(&self) -> &SessionConfig {
        &self.inner.session_config
    }

    async fn open_session(&self) -> Result<Session, Error> {
        let inner = &*self.inner;
        let transport = inner.connector.connect(&inner.session_config).await?;
        let session = Session::new(
            transport,
            inner.session_config.clone(),
            inner.buffers.clone(),
            Arc::clone(&inner.capacity),
        )?;
        session.start().await?;

        let opened = inner.sessions_opened.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(session = session.id(), sessions_opened = opened, "pool opened session");
        Ok(session)
    }

    fn acquire_timeout(&self, timeout: Duration) -> Error {
        self.inner.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(timeout = ?timeout, "slot acquisition timed out");
        Error::AcquisitionTimeout(timeout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _config: &SessionConfig) -> Result<BoxedTransport, Error> {
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
        }
    }

    #[test]
    fn test_new_validates_configs() {
        let err = Pool::new(
            PoolConfig::new().max_connections(0),
            SessionConfig::new(),
            RefusingConnector,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Pool::new(PoolConfig::new(), SessionConfig::new().host(""), RefusingConnector)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_new_pool_is_empty() {
        let pool = Pool::new(PoolConfig::new(), SessionConfig::new(), RefusingConnector).unwrap();
        let status = pool.status();
        assert_eq!(status.sessions, 0);
        assert_eq!(status.opening, 0);
        assert_eq!(status.max, 10);
        assert!(!pool.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let pool = Pool::new(PoolConfig::new(), SessionConfig::new(), RefusingConnector).unwrap();
        let err = pool
            .get_slot(false, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(pool.status().opening, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_requests() {
        let pool = Pool::new(PoolConfig::new(), SessionConfig::new(), RefusingConnector).unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get_slot(false, Duration::from_secs(1)).await,
            Err(Error::PoolClosed)
        ));
    }
}
