//! Forward listener errors

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ForwardError {
    /// The requested local port is held by someone else
    #[error("Port {port} is already in use on {address}")]
    PortInUse { address: String, port: u16 },

    /// Bind failed for a reason other than the port being busy
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// The server refused to set up forwarding at all
    #[error("SSH server refused forwarding: {reason}")]
    ChannelRejected { reason: String },

    /// The server refused `tcpip-forward` for this address and port
    #[error("Remote bind {address}:{port} rejected: {reason}")]
    RemoteRejected {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("SSH session lost")]
    SessionLost,
}
