//! Multiplexed SSH transport seam
//!
//! Everything above the session pool talks to an SSH connection through
//! [`SshTransport`]. The production implementation is [`HandleController`]
//! (see `handle_owner`); tests plug in an in-process double.
//!
//! [`HandleController`]: super::HandleController

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use super::error::SshError;

/// A byte stream carried by one SSH channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelIo for T {}

/// Boxed channel stream handed to relays
pub type ChannelStream = Box<dyn ChannelIo>;

#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Open a `direct-tcpip` channel to `host:port` as seen from the server.
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<ChannelStream, SshError>;

    /// Ask the server to listen on `address:port` (`tcpip-forward`).
    ///
    /// Returns the port actually bound. A refusal is `SshError::ForwardRejected`.
    async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError>;

    /// Cancel a previous `tcpip-forward`.
    async fn cancel_tcpip_forward(&self, address: &str, port: u16) -> Result<(), SshError>;

    /// Receiver that fires once when the transport goes away.
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    /// Whether the transport is still usable.
    fn is_connected(&self) -> bool;

    /// Close the transport. Subscribers of `subscribe_disconnect` are notified.
    async fn disconnect(&self);
}
