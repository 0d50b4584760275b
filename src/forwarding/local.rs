//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: Forward local:8888 -> remote_jupyter:8888

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::ForwardError;
use super::listener::{ListenerHandle, ListenerState};
use super::relay::{relay, ActiveConnectionGuard, ForwardStatsAtomic};
use crate::ssh::SshTransport;

/// Local port forwarding parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1")
    pub bind_address: String,
    pub local_port: u16,
    /// Remote host to connect to through SSH (e.g., "localhost")
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        bind_address: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Bind the local socket and spawn the accept loop.
///
/// For each accepted client a `direct-tcpip` channel to
/// `remote_host:remote_port` is opened and relayed in its own task. A failing
/// client connection is logged and dropped; it never affects the listener.
pub async fn start_local_forward(
    transport: Arc<dyn SshTransport>,
    config: LocalForward,
    idle_timeout: Duration,
) -> Result<ListenerHandle, ForwardError> {
    // Subscribe before the liveness check so a disconnect in between is not lost
    let mut disconnect_rx = transport.subscribe_disconnect();
    if !transport.is_connected() {
        return Err(ForwardError::SessionLost);
    }

    let address = format!("{}:{}", config.bind_address, config.local_port);
    let listener = TcpListener::bind((config.bind_address.as_str(), config.local_port))
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => ForwardError::PortInUse {
                address: config.bind_address.clone(),
                port: config.local_port,
            },
            ErrorKind::PermissionDenied => ForwardError::Bind {
                address: address.clone(),
                reason: "permission denied (ports below 1024 require elevated privileges)"
                    .to_string(),
            },
            _ => ForwardError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            },
        })?;

    let bound_port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(config.local_port);
    let description = format!(
        "{}:{} -> {}:{}",
        config.bind_address, bound_port, config.remote_host, config.remote_port
    );
    info!("Started local port forward: {}", description);

    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(ListenerState::Active);
    let stats = Arc::new(ForwardStatsAtomic::new());

    let task = {
        let cancel = cancel.clone();
        let stats = stats.clone();
        let description = description.clone();
        tokio::spawn(async move {
            let mut relays = JoinSet::new();

            let exit = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Local port forward {} stopped by request", description);
                        break ListenerState::Stopped;
                    }

                    _ = disconnect_rx.recv() => {
                        warn!("Local port forward {} lost its SSH session", description);
                        break ListenerState::SessionLost;
                    }

                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted connection from {} for {}", peer_addr, description);
                                relays.spawn(handle_forward_connection(
                                    transport.clone(),
                                    stream,
                                    config.remote_host.clone(),
                                    config.remote_port,
                                    stats.clone(),
                                    idle_timeout,
                                ));
                            }
                            Err(e) => {
                                error!("Accept error on {}: {}", description, e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }

                    // Reap finished relays so the set doesn't grow unbounded
                    Some(_) = relays.join_next(), if !relays.is_empty() => {}
                }
            };

            drop(listener);
            relays.shutdown().await;
            let _ = state_tx.send(exit);
            info!("Local port forward task exited");
        })
    };

    Ok(ListenerHandle::new(
        description,
        bound_port,
        cancel,
        task,
        state_rx,
        stats,
    ))
}

async fn handle_forward_connection(
    transport: Arc<dyn SshTransport>,
    stream: TcpStream,
    remote_host: String,
    remote_port: u16,
    stats: Arc<ForwardStatsAtomic>,
    idle_timeout: Duration,
) {
    let _active = ActiveConnectionGuard::new(&stats);

    // Disable Nagle's algorithm for low-latency forwarding
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let channel = match transport.open_direct_tcpip(&remote_host, remote_port).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "Failed to open channel to {}:{}: {}",
                remote_host, remote_port, e
            );
            return;
        }
    };
    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    if let Err(e) = relay(stream, channel, &stats, idle_timeout).await {
        debug!("Forward connection to {}:{} ended: {}", remote_host, remote_port, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::{spawn_echo_server, MockTransport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const IDLE: Duration = Duration::from_secs(30);

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_local_forward_relays_to_target() {
        let echo_port = spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new());
        let port = free_port();

        let handle = start_local_forward(
            transport.clone(),
            LocalForward::new("127.0.0.1", port, "127.0.0.1", echo_port),
            IDLE,
        )
        .await
        .unwrap();
        assert_eq!(handle.bound_port(), port);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(transport.direct_tcpip_opened(), 1);

        handle.stop(Duration::from_secs(2)).await;
        assert_eq!(handle.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_port_in_use_is_reported() {
        let holder = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let transport = Arc::new(MockTransport::new());

        let err = start_local_forward(
            transport,
            LocalForward::new("127.0.0.1", port, "127.0.0.1", 80),
            IDLE,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            ForwardError::PortInUse {
                address: "127.0.0.1".into(),
                port
            }
        );
    }

    #[tokio::test]
    async fn test_failed_channel_does_not_kill_listener() {
        let echo_port = spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new());
        let port = free_port();
        let handle = start_local_forward(
            transport.clone(),
            LocalForward::new("127.0.0.1", port, "127.0.0.1", echo_port),
            IDLE,
        )
        .await
        .unwrap();

        transport.reject_channels(true);
        let mut rejected = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        // Channel refused: the client just sees EOF
        assert_eq!(rejected.read(&mut buf).await.unwrap(), 0);

        transport.reject_channels(false);
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"x").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert!(handle.state().is_active());

        handle.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_session_loss_fails_listener() {
        let transport = Arc::new(MockTransport::new());
        let handle = start_local_forward(
            transport.clone(),
            LocalForward::new("127.0.0.1", free_port(), "127.0.0.1", 80),
            IDLE,
        )
        .await
        .unwrap();

        transport.disconnect().await;
        assert_eq!(handle.closed().await, ListenerState::SessionLost);
    }

    #[tokio::test]
    async fn test_stop_with_inflight_relays_is_bounded() {
        // Target accepts but never answers, so relays sit in read()
        let silent = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let silent_port = silent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = silent.accept().await {
                held.push(s);
            }
        });

        let transport = Arc::new(MockTransport::new());
        let port = free_port();
        let handle = start_local_forward(
            transport,
            LocalForward::new("127.0.0.1", port, "127.0.0.1", silent_port),
            IDLE,
        )
        .await
        .unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut c = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            c.write_all(b"req").await.unwrap();
            clients.push(c);
        }
        // Give the accept loop time to spawn the relays
        for _ in 0..50 {
            if handle.stats().active_connections == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().active_connections, 3);

        tokio::time::timeout(Duration::from_secs(3), handle.stop(Duration::from_secs(2)))
            .await
            .expect("stop hung");
        assert_eq!(handle.stats().active_connections, 0);

        // Clients observe the relays closing
        for mut c in clients {
            let mut buf = [0u8; 8];
            let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }
}
