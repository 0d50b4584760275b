//! Remote Port Forwarding
//!
//! Forwards connections from a remote port back to a local host:port through SSH.
//! Example: Remote server:9000 -> local:3000 (expose local service to remote)
//!
//! ## Architecture
//!
//! Remote forwarding requires coordination between:
//! 1. The SSH client (sends `tcpip-forward` request via the transport)
//! 2. The SSH server (listens on remote port)
//! 3. The ClientHandler callback (receives incoming `forwarded-tcpip` channels)
//!
//! Every pooled session owns a [`RemoteForwardRegistry`]. The ClientHandler
//! hands each forwarded channel to the registry, which routes it to the
//! listener task that requested that `(address, port)`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ForwardError;
use super::listener::{ListenerHandle, ListenerState};
use super::relay::{relay, ActiveConnectionGuard, ForwardStatsAtomic};
use crate::ssh::{ChannelStream, SshError, SshTransport};

/// Pending forwarded channels per listener before the handler starts refusing
const INCOMING_QUEUE: usize = 64;

/// Bound on the server round-trip when cancelling a forward during stop
const CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// A channel the server opened for a connection to a forwarded port
pub struct IncomingChannel {
    pub stream: ChannelStream,
    /// `host:port` of the peer that connected on the server side
    pub originator: String,
}

/// Per-session routing table for forwarded-tcpip channels
#[derive(Default)]
pub struct RemoteForwardRegistry {
    routes: DashMap<(String, u16), mpsc::Sender<IncomingChannel>>,
}

impl RemoteForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(address, port)`. Channels for it arrive on the returned receiver.
    ///
    /// Returns `None` when another listener already holds the route; the
    /// existing route is left untouched.
    pub fn register(&self, address: &str, port: u16) -> Option<mpsc::Receiver<IncomingChannel>> {
        match self.routes.entry((address.to_string(), port)) {
            Entry::Occupied(_) => {
                debug!("Remote forward route {}:{} already held", address, port);
                None
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
                slot.insert(tx);
                debug!("Registered remote forward route {}:{}", address, port);
                Some(rx)
            }
        }
    }

    pub fn unregister(&self, address: &str, port: u16) {
        self.routes.remove(&(address.to_string(), port));
        debug!("Unregistered remote forward route {}:{}", address, port);
    }

    /// Route a forwarded channel. Servers sometimes report the bound address
    /// spelled differently ("localhost" vs "127.0.0.1"), so an unmatched
    /// address falls back to the only route on that port.
    ///
    /// Gives the channel back when nobody claims it.
    pub fn dispatch(
        &self,
        address: &str,
        port: u16,
        incoming: IncomingChannel,
    ) -> Result<(), IncomingChannel> {
        let sender = self
            .routes
            .get(&(address.to_string(), port))
            .map(|r| r.value().clone())
            .or_else(|| {
                let mut on_port = self.routes.iter().filter(|r| r.key().1 == port);
                match (on_port.next(), on_port.next()) {
                    (Some(only), None) => Some(only.value().clone()),
                    _ => None,
                }
            });

        match sender {
            Some(tx) => tx.try_send(incoming).map_err(|e| match e {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            }),
            None => Err(incoming),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Remote port forwarding parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    /// Address the server listens on ("127.0.0.1", or "0.0.0.0" to expose publicly)
    pub bind_address: String,
    pub remote_port: u16,
    /// Client-side target host for relayed connections
    pub local_host: String,
    pub local_port: u16,
}

impl RemoteForward {
    pub fn new(
        bind_address: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }
}

/// Ask the server to listen and spawn the dispatch loop.
///
/// A refused `tcpip-forward` surfaces as [`ForwardError::RemoteRejected`].
pub async fn start_remote_forward(
    transport: Arc<dyn SshTransport>,
    routes: Arc<RemoteForwardRegistry>,
    config: RemoteForward,
    idle_timeout: Duration,
) -> Result<ListenerHandle, ForwardError> {
    let mut disconnect_rx = transport.subscribe_disconnect();
    if !transport.is_connected() {
        return Err(ForwardError::SessionLost);
    }

    info!(
        "Requesting remote port forward: {}:{} -> {}:{}",
        config.bind_address, config.remote_port, config.local_host, config.local_port
    );

    // Route first: the server may open a channel as soon as it replies
    let Some(mut incoming_rx) = routes.register(&config.bind_address, config.remote_port) else {
        return Err(route_taken(&config.bind_address, config.remote_port));
    };
    let bound_port = match transport
        .tcpip_forward(&config.bind_address, config.remote_port)
        .await
    {
        Ok(port) => port,
        Err(e) => {
            routes.unregister(&config.bind_address, config.remote_port);
            return Err(map_forward_error(&config.bind_address, config.remote_port, e));
        }
    };
    if bound_port != config.remote_port {
        routes.unregister(&config.bind_address, config.remote_port);
        incoming_rx = match routes.register(&config.bind_address, bound_port) {
            Some(rx) => rx,
            None => {
                if let Err(e) = transport
                    .cancel_tcpip_forward(&config.bind_address, bound_port)
                    .await
                {
                    warn!(
                        "Failed to release remote forward {}:{}: {}",
                        config.bind_address, bound_port, e
                    );
                }
                return Err(route_taken(&config.bind_address, bound_port));
            }
        };
    }

    let description = format!(
        "remote {}:{} -> {}:{}",
        config.bind_address, bound_port, config.local_host, config.local_port
    );
    info!("Remote forward established: {}", description);

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
                        info!("Remote port forward {} stopped by request", description);
                        break ListenerState::Stopped;
                    }

                    _ = disconnect_rx.recv() => {
                        warn!("Remote port forward {} lost its SSH session", description);
                        break ListenerState::SessionLost;
                    }

                    incoming = incoming_rx.recv() => {
                        match incoming {
                            Some(incoming) => {
                                debug!("Forwarded connection from {} on {}", incoming.originator, description);
                                relays.spawn(handle_forwarded_connection(
                                    incoming.stream,
                                    config.local_host.clone(),
                                    config.local_port,
                                    stats.clone(),
                                    idle_timeout,
                                ));
                            }
                            None => break ListenerState::Failed("forward route dropped".to_string()),
                        }
                    }

                    Some(_) = relays.join_next(), if !relays.is_empty() => {}
                }
            };

            routes.unregister(&config.bind_address, bound_port);
            relays.shutdown().await;

            if exit == ListenerState::Stopped {
                match tokio::time::timeout(
                    CANCEL_TIMEOUT,
                    transport.cancel_tcpip_forward(&config.bind_address, bound_port),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to cancel remote forward {}: {}", description, e),
                    Err(_) => warn!("Timed out cancelling remote forward {}", description),
                }
            }

            let _ = state_tx.send(exit);
            info!("Remote port forward task exited");
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

/// Whether the server would accept a forward on `address:port` right now.
///
/// Requests the forward and cancels it straight away.
pub async fn probe_remote_port(transport: &dyn SshTransport, address: &str, port: u16) -> bool {
    match transport.tcpip_forward(address, port).await {
        Ok(bound) => {
            if let Err(e) = transport.cancel_tcpip_forward(address, bound).await {
                warn!("Failed to release probe forward {}:{}: {}", address, bound, e);
            }
            true
        }
        Err(e) => {
            debug!("Remote port {}:{} unavailable: {}", address, port, e);
            false
        }
    }
}

fn route_taken(address: &str, port: u16) -> ForwardError {
    ForwardError::RemoteRejected {
        address: address.to_string(),
        port,
        reason: "already forwarded on this session".to_string(),
    }
}

fn map_forward_error(address: &str, port: u16, err: SshError) -> ForwardError {
    match err {
        SshError::ForwardRejected(reason) => ForwardError::RemoteRejected {
            address: address.to_string(),
            port,
            reason,
        },
        SshError::Disconnected => ForwardError::SessionLost,
        other => ForwardError::ChannelRejected {
            reason: other.to_string(),
        },
    }
}

async fn handle_forwarded_connection(
    channel: ChannelStream,
    local_host: String,
    local_port: u16,
    stats: Arc<ForwardStatsAtomic>,
    idle_timeout: Duration,
) {
    let _active = ActiveConnectionGuard::new(&stats);

    let local_stream = match TcpStream::connect((local_host.as_str(), local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to connect to {}:{}: {}", local_host, local_port, e);
            return;
        }
    };

    // Disable Nagle's algorithm for low-latency forwarding
    if let Err(e) = local_stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    if let Err(e) = relay(local_stream, channel, &stats, idle_timeout).await {
        debug!("Forwarded connection to {}:{} ended: {}", local_host, local_port, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::{spawn_echo_server, MockTransport};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const IDLE: Duration = Duration::from_secs(30);

    fn incoming(stream: tokio::io::DuplexStream) -> IncomingChannel {
        IncomingChannel {
            stream: Box::new(stream),
            originator: "10.0.0.9:51000".into(),
        }
    }

    #[tokio::test]
    async fn test_registry_routing_and_fallback() {
        let registry = RemoteForwardRegistry::new();
        let mut rx = registry.register("127.0.0.1", 9000).unwrap();
        assert!(registry.register("127.0.0.1", 9000).is_none());

        let (a, _a_peer) = duplex(8);
        assert!(registry.dispatch("127.0.0.1", 9000, incoming(a)).is_ok());
        assert!(rx.recv().await.is_some());

        // Address spelled differently by the server
        let (b, _b_peer) = duplex(8);
        assert!(registry.dispatch("localhost", 9000, incoming(b)).is_ok());

        let (c, _c_peer) = duplex(8);
        assert!(registry.dispatch("127.0.0.1", 9001, incoming(c)).is_err());

        registry.unregister("127.0.0.1", 9000);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remote_forward_relays_back_to_local() {
        let echo_port = spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new());
        let routes = Arc::new(RemoteForwardRegistry::new());

        let handle = start_remote_forward(
            transport.clone(),
            routes.clone(),
            RemoteForward::new("127.0.0.1", 9000, "127.0.0.1", echo_port),
            IDLE,
        )
        .await
        .unwrap();
        assert_eq!(handle.bound_port(), 9000);
        assert!(transport.has_remote_forward(9000));

        // Server side: someone connects to :9000
        let (channel, mut server_peer) = duplex(1024);
        assert!(routes.dispatch("127.0.0.1", 9000, incoming(channel)).is_ok());
        server_peer.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        handle.stop(Duration::from_secs(2)).await;
        assert!(!transport.has_remote_forward(9000));
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_remote_bind() {
        let transport = Arc::new(MockTransport::new());
        transport.occupy_remote_port(9000);
        let routes = Arc::new(RemoteForwardRegistry::new());

        let err = start_remote_forward(
            transport.clone(),
            routes.clone(),
            RemoteForward::new("127.0.0.1", 9000, "127.0.0.1", 3000),
            IDLE,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ForwardError::RemoteRejected { port: 9000, .. }));
        assert!(routes.is_empty());

        assert!(!probe_remote_port(transport.as_ref(), "127.0.0.1", 9000).await);
        assert!(probe_remote_port(transport.as_ref(), "127.0.0.1", 9001).await);
        assert!(!transport.has_remote_forward(9001));
    }

    #[tokio::test]
    async fn test_duplicate_route_is_refused_without_disturbing_owner() {
        let transport = Arc::new(MockTransport::new());
        let routes = Arc::new(RemoteForwardRegistry::new());

        let owner = start_remote_forward(
            transport.clone(),
            routes.clone(),
            RemoteForward::new("127.0.0.1", 9000, "127.0.0.1", 3000),
            IDLE,
        )
        .await
        .unwrap();

        let err = start_remote_forward(
            transport.clone(),
            routes.clone(),
            RemoteForward::new("127.0.0.1", 9000, "127.0.0.1", 3001),
            IDLE,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ForwardError::RemoteRejected { port: 9000, .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(owner.state(), ListenerState::Active);
        assert_eq!(routes.len(), 1);
        assert!(transport.has_remote_forward(9000));

        owner.stop(Duration::from_secs(1)).await;
        assert!(routes.is_empty());
    }
}
