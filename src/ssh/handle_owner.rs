//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, connection_id, disconnect_tx);
//!
//! // Open a tunnel channel
//! let stream = controller.open_direct_tcpip("127.0.0.1", 5432).await?;
//!
//! // Request remote forward
//! let bound_port = controller.tcpip_forward("0.0.0.0", 8080).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::transport::{ChannelStream, SshTransport};

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (for local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the senders). Any holder has full control of the
/// connection, so controllers never leave the session pool except wrapped in
/// an opaque session handle.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Broadcast sender for SSH disconnect notification.
    /// Subscribers (like port forwards) can listen for disconnection.
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Create a controller around an existing command channel.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, disconnect_tx: broadcast::Sender<()>) -> Self {
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, russh::Error>>) -> HandleCommand,
    ) -> Result<Result<T, russh::Error>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }
}

#[async_trait]
impl SshTransport for HandleController {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<ChannelStream, SshError> {
        let channel = self
            .request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port: port as u32,
                originator_host: "127.0.0.1".to_string(),
                originator_port: 0,
                reply_tx,
            })
            .await?
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        Ok(Box::new(Box::pin(channel.into_stream())))
    }

    async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError> {
        let bound = self
            .request(|reply_tx| HandleCommand::TcpipForward {
                address: address.to_string(),
                port: port as u32,
                reply_tx,
            })
            .await?
            .map_err(|e| match e {
                russh::Error::RequestDenied => {
                    SshError::ForwardRejected(format!("{}:{} refused by server", address, port))
                }
                other => SshError::ProtocolError(other.to_string()),
            })?;
        // Servers reply with 0 when the requested port was honoured as-is.
        Ok(if bound == 0 { port } else { bound as u16 })
    }

    async fn cancel_tcpip_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        self.request(|reply_tx| HandleCommand::CancelTcpipForward {
            address: address.to_string(),
            port: port as u32,
            reply_tx,
        })
        .await?
        .map_err(SshError::from)
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }
}

/// How often the owner task checks whether russh closed the session on its own
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
/// `disconnect_tx` fires once when the loop ends, whatever the cause.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    connection_id: String,
    disconnect_tx: broadcast::Sender<()>,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle; // Move into task, becomes sole owner

        info!("Handle owner task started for connection {}", connection_id);

        // Keepalive failures close the session underneath us without a command
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH transport for connection {} went down", connection_id);
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(host, port, originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Channel will be dropped, SSH server will close it
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                Some(HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.tcpip_forward(address.clone(), port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = if *bound_port == 0 { port } else { *bound_port };
                            if reply_tx.send(result).is_err() {
                                // Caller disappeared but the server is listening: cancel
                                // right away so no ghost forward is left behind.
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                Some(HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.cancel_tcpip_forward(address, port).await;
                    if reply_tx.send(result).is_err() {
                        debug!("Caller dropped before receiving cancel_tcpip_forward result");
                    }
                }

                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for connection {}", connection_id);
                    break;
                }

                None => {
                    info!("All controllers dropped for connection {}", connection_id);
                    break;
                }
            }
        }

        // Notify all disconnect subscribers (port forwards, the pool watcher).
        // The send() may fail if no subscribers, which is fine
        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for connection {}", connection_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
