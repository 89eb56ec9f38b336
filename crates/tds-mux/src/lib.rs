//! # tds-mux
//!
//! Pipelined and multiplexed TDS sessions behind a slot-based pool.
//!
//! A [`Session`] is one logged-in connection. Instead of handing a whole
//! connection to one caller, it hands out [`OperationSlot`]s: up to
//! [`SessionConfig::pipeline_depth`] commands may be written before any
//! response is read, and responses are delivered to their slots strictly in
//! write order.
//!
//! ```text
//! Pool ─get_slot─▶ Session ─try_start_operation─▶ OperationSlot
//!                                                     │ write
//!                                                     ▼
//!                                              CommandExecution
//!                                                     │ read (in write order)
//!                                                     ▼
//!                                              ResultSetReader
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tds_mux::{Command, Pool, PoolConfig, SessionConfig, TcpConnector};
//!
//! # async fn run() -> Result<(), tds_mux::Error> {
//! let session_config = SessionConfig::new()
//!     .host("localhost")
//!     .credentials("sa", "Password123!")
//!     .pipeline_depth(8);
//! let pool = Pool::new(PoolConfig::new().max_connections(4), session_config, TcpConnector)?;
//!
//! let first = pool.write_multiplexing_command(&Command::new("SELECT 1")).await?;
//! let second = pool.write_multiplexing_command(&Command::new("SELECT 2")).await?;
//!
//! // responses arrive in write order
//! first.read().await?.finish()?;
//! let mut rows = second.read().await?;
//! while rows.next_row()? {
//!     println!("{}", rows.get_i32(0)?);
//! }
//! rows.finish()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod command;
pub mod config;
pub mod error;
pub mod pool;
pub mod result;
pub mod session;
pub mod slot;

pub use command::{Command, CommandFlags, ExecutionFlags, FlushMode};
pub use config::{PoolConfig, SessionConfig};
pub use error::Error;
pub use pool::{Connector, Pool, PoolStatus, TcpConnector};
pub use result::ResultSetReader;
pub use session::{BoxedTransport, Session, SessionEnv, SessionState, Transport};
pub use slot::{CommandExecution, OperationSlot, SlotState};
