//! SSH module - handles SSH connections and the session pool
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Direct SSH connections
//! - Jump host chains (SSH-over-SSH through pooled bastion sessions)
//! - Host key verification via ~/.ssh/known_hosts
//! - Reference-counted session pool with idle grace period (see `session_pool`)

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
#[cfg(test)]
pub(crate) mod mock;
pub mod session_pool;
mod transport;

pub use client::{ClientHandler, ConnectorSettings, RusshConnector, SessionConnector};
pub use config::{AuthMethod, Connection, ConnectionBook, ConnectionProvider};
pub use error::{ConnectError, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use session_pool::{SessionHandle, SessionInfo, SessionState, SshSessionPool, Usage};
pub use transport::{ChannelIo, ChannelStream, SshTransport};
