//! Session and pool configuration.

use std::fmt;
use std::time::Duration;

use tds_framing::buffer::{DEFAULT_POOL_CAPACITY, DEFAULT_SEGMENT_SIZE};
use tds_wire::{DEFAULT_PACKET_SIZE, MIN_PACKET_SIZE, TdsVersion, UnknownTokenPolicy};

use crate::error::Error;

/// Largest packet size a client may request at login.
pub const MAX_REQUESTED_PACKET_SIZE: usize = 32767;

/// Default slots per session.
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;

/// Settings for one physical connection.
///
/// Marked `#[non_exhaustive]`; construct with [`SessionConfig::new`] and the
/// builder methods.
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Server host name or address.
    pub host: String,

    /// Server TCP port.
    pub port: u16,

    /// SQL login name.
    pub username: String,

    /// SQL login password.
    pub password: String,

    /// Initial database; the server default when `None`.
    pub database: Option<String>,

    /// Application name reported at login.
    pub application_name: String,

    /// Client machine name reported at login.
    pub client_host: String,

    /// Packet size requested at login.
    pub packet_size: usize,

    /// Protocol version requested at login.
    pub tds_version: TdsVersion,

    /// Bound on TCP connect plus handshake.
    pub connect_timeout: Duration,

    /// Default response deadline for commands without their own timeout.
    pub command_timeout: Option<Duration>,

    /// Maximum concurrent slots on one connection.
    pub pipeline_depth: usize,

    /// What to do with token tags the decoder does not know.
    pub unknown_token_policy: UnknownTokenPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1433,
            username: String::new(),
            password: String::new(),
            database: None,
            application_name: "tds-mux".into(),
            client_host: String::new(),
            packet_size: DEFAULT_PACKET_SIZE,
            tds_version: TdsVersion::V7_4,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Some(Duration::from_secs(30)),
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            unknown_token_policy: UnknownTokenPolicy::Reject,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("client_host", &self.client_host)
            .field("packet_size", &self.packet_size)
            .field("tds_version", &self.tds_version)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("pipeline_depth", &self.pipeline_depth)
            .field("unknown_token_policy", &self.unknown_token_policy)
            .finish()
    }
}

impl SessionConfig {
    /// Configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set SQL login credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn client_host(mut self, name: impl Into<String>) -> Self {
        self.client_host = name.into();
        self
    }

    /// Set the packet size to request at login.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the protocol version to request.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set the connect and handshake timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default command timeout; `None` waits indefinitely.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set how many slots one connection may hold at once.
    #[must_use]
    pub fn pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Set the unknown-token policy.
    #[must_use]
    pub fn unknown_token_policy(mut self, policy: UnknownTokenPolicy) -> Self {
        self.unknown_token_policy = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if !(MIN_PACKET_SIZE..=MAX_REQUESTED_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet_size must be within {MIN_PACKET_SIZE}..={MAX_REQUESTED_PACKET_SIZE}, got {}",
                self.packet_size
            )));
        }
        if self.pipeline_depth == 0 {
            return Err(Error::Config(
                "pipeline_depth must be greater than 0".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config(
                "connect_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of physical connections.
    pub max_connections: usize,

    /// How long [`Pool::get_slot`](crate::Pool::get_slot) waits by default.
    pub acquire_timeout: Duration,

    /// Free buffers kept by the shared buffer pool.
    pub buffer_pool_capacity: usize,

    /// Size of freshly allocated buffer segments.
    pub segment_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            buffer_pool_capacity: DEFAULT_POOL_CAPACITY,
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the default slot acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set how many free buffers the buffer pool retains.
    #[must_use]
    pub fn buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self
    }

    /// Set the buffer segment size.
    #[must_use]
    pub fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.segment_size == 0 {
            return Err(Error::Config("segment_size must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_config() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 1433);
        assert_eq!(config.packet_size, DEFAULT_PACKET_SIZE);
        assert_eq!(config.pipeline_depth, DEFAULT_PIPELINE_DEPTH);
        assert_eq!(config.unknown_token_policy, UnknownTokenPolicy::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_builder_methods() {
        let config = SessionConfig::new()
            .host("db.internal")
            .port(14330)
            .credentials("app", "secret")
            .database("orders")
            .packet_size(8192)
            .pipeline_depth(4)
            .command_timeout(None);

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 14330);
        assert_eq!(config.username, "app");
        assert_eq!(config.database.as_deref(), Some("orders"));
        assert_eq!(config.packet_size, 8192);
        assert_eq!(config.pipeline_depth, 4);
        assert!(config.command_timeout.is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SessionConfig::new().credentials("app", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_packet_size_bounds() {
        assert!(SessionConfig::new().packet_size(511).validate().is_err());
        assert!(SessionConfig::new().packet_size(512).validate().is_ok());
        assert!(SessionConfig::new().packet_size(32767).validate().is_ok());

        let err = SessionConfig::new().packet_size(32768).validate().unwrap_err();
        assert!(err.to_string().contains("packet_size must be within"));
    }

    #[test]
    fn test_session_validation_rejects_empty_host_and_zero_depth() {
        let err = SessionConfig::new().host("  ").validate().unwrap_err();
        assert!(err.to_string().contains("host must not be empty"));

        let err = SessionConfig::new().pipeline_depth(0).validate().unwrap_err();
        assert!(err.to_string().contains("pipeline_depth"));
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::new().validate().is_ok());

        let err = PoolConfig::new().max_connections(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_connections must be greater than 0"));

        assert!(PoolConfig::new().segment_size(0).validate().is_err());
    }
}
