//! Commands handed to a slot and the flags shared with their results.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use tds_wire::PacketStatus;

bitflags! {
    /// Per-command request options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandFlags: u8 {
        /// Reset session state before the command runs.
        const RESET_CONNECTION = 0x01;
        /// Reset session state but keep the open transaction.
        const RESET_KEEP_TRANSACTION = 0x02;
    }
}

/// A statement to send as a SQL batch.
#[derive(Debug, Clone)]
pub struct Command {
    text: Arc<str>,
    timeout: Option<Duration>,
    flags: CommandFlags,
}

impl Command {
    /// Command with the session's default timeout and no flags.
    #[must_use]
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self {
            text: text.into(),
            timeout: None,
            flags: CommandFlags::empty(),
        }
    }

    /// Override the response deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set request flags.
    #[must_use]
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Statement text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Explicit timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Request flags.
    #[must_use]
    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// Status bits for the first packet of the request.
    pub(crate) fn packet_status(&self) -> PacketStatus {
        let mut status = PacketStatus::NORMAL;
        if self.flags.contains(CommandFlags::RESET_KEEP_TRANSACTION) {
            status |= PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION;
        } else if self.flags.contains(CommandFlags::RESET_CONNECTION) {
            status |= PacketStatus::RESET_CONNECTION;
        }
        status
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// When a written request reaches the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Flush as part of the write.
    #[default]
    Immediate,
    /// Leave the bytes buffered so later writes share one flush.
    ///
    /// Reading the response flushes them if nothing else has.
    Deferred,
}

/// Observable state of a command's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionFlags {
    /// At least one row was returned.
    pub has_rows: bool,
    /// The server reported an error.
    pub had_error: bool,
    /// The caller cancelled or timed out.
    pub cancellation_requested: bool,
}

const HAS_ROWS: u8 = 0x01;
const HAD_ERROR: u8 = 0x02;
const CANCELLED: u8 = 0x04;

/// [`ExecutionFlags`] shared between an execution and its reader.
#[derive(Debug, Default)]
pub(crate) struct SharedFlags(AtomicU8);

impl SharedFlags {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_has_rows(&self) {
        self.0.fetch_or(HAS_ROWS, Ordering::Relaxed);
    }

    pub(crate) fn set_had_error(&self) {
        self.0.fetch_or(HAD_ERROR, Ordering::Relaxed);
    }

    pub(crate) fn set_cancelled(&self) {
        self.0.fetch_or(CANCELLED, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ExecutionFlags {
        let bits = self.0.load(Ordering::Relaxed);
        ExecutionFlags {
            has_rows: bits & HAS_ROWS != 0,
            had_error: bits & HAD_ERROR != 0,
            cancellation_requested: bits & CANCELLED != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_flags_map_to_first_packet_status() {
        assert_eq!(Command::new("SELECT 1").packet_status(), PacketStatus::NORMAL);

        let reset = Command::new("SELECT 1").with_flags(CommandFlags::RESET_CONNECTION);
        assert_eq!(reset.packet_status(), PacketStatus::RESET_CONNECTION);

        let keep = Command::new("SELECT 1")
            .with_flags(CommandFlags::RESET_CONNECTION | CommandFlags::RESET_KEEP_TRANSACTION);
        assert_eq!(
            keep.packet_status(),
            PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION
        );
    }

    #[test]
    fn test_shared_flags_accumulate() {
        let flags = SharedFlags::new();
        assert_eq!(flags.snapshot(), ExecutionFlags::default());

        flags.set_has_rows();
        flags.set_had_error();
        let snap = flags.snapshot();
        assert!(snap.has_rows);
        assert!(snap.had_error);
        assert!(!snap.cancellation_requested);

        flags.set_cancelled();
        assert!(flags.snapshot().cancellation_requested);
    }

    #[test]
    fn test_command_conversions() {
        let cmd: Command = "SELECT 1".into();
        assert_eq!(cmd.text(), "SELECT 1");
        assert!(cmd.timeout().is_none());

        let cmd = Command::from(String::from("SELECT 2")).with_timeout(Duration::from_secs(5));
        assert_eq!(cmd.timeout(), Some(Duration::from_secs(5)));
    }
}
