//! In-process transport and connector doubles for tests
//!
//! `MockTransport` opens real TCP connections for `direct-tcpip` and keeps a
//! set of "server-side" ports for `tcpip-forward`, so listeners can be
//! exercised end to end against local sockets.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use super::client::SessionConnector;
use super::config::Connection;
use super::error::SshError;
use super::transport::{ChannelStream, SshTransport};
use crate::forwarding::RemoteForwardRegistry;

pub struct MockTransport {
    connected: AtomicBool,
    disconnect_tx: broadcast::Sender<()>,
    reject_channels: AtomicBool,
    refuse_all_forwards: AtomicBool,
    direct_tcpip_opened: AtomicUsize,
    /// Ports some other process holds on the "server"
    occupied: Mutex<HashSet<u16>>,
    /// Ports currently forwarded by this transport
    forwards: Mutex<HashSet<u16>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (disconnect_tx, _) = broadcast::channel(4);
        Self {
            connected: AtomicBool::new(true),
            disconnect_tx,
            reject_channels: AtomicBool::new(false),
            refuse_all_forwards: AtomicBool::new(false),
            direct_tcpip_opened: AtomicUsize::new(0),
            occupied: Mutex::new(HashSet::new()),
            forwards: Mutex::new(HashSet::new()),
        }
    }

    pub fn reject_channels(&self, reject: bool) {
        self.reject_channels.store(reject, Ordering::SeqCst);
    }

    /// Behave like a server with `AllowTcpForwarding no`
    pub fn refuse_all_forwards(&self) {
        self.refuse_all_forwards.store(true, Ordering::SeqCst);
    }

    pub fn occupy_remote_port(&self, port: u16) {
        self.occupied.lock().insert(port);
    }

    pub fn has_remote_forward(&self, port: u16) -> bool {
        self.forwards.lock().contains(&port)
    }

    pub fn direct_tcpip_opened(&self) -> usize {
        self.direct_tcpip_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshTransport for MockTransport {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<ChannelStream, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        if self.reject_channels.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("open failed: administratively prohibited".into()));
        }
        let stream = TcpStream::connect((host, port)).await?;
        self.direct_tcpip_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }

    async fn tcpip_forward(&self, address: &str, port: u16) -> Result<u16, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        let refused = self.refuse_all_forwards.load(Ordering::SeqCst)
            || self.occupied.lock().contains(&port)
            || !self.forwards.lock().insert(port);
        if refused {
            return Err(SshError::ForwardRejected(format!(
                "{}:{} refused by server",
                address, port
            )));
        }
        Ok(port)
    }

    async fn cancel_tcpip_forward(&self, _address: &str, port: u16) -> Result<(), SshError> {
        self.forwards.lock().remove(&port);
        Ok(())
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.disconnect_tx.send(());
        }
    }
}

/// How a scripted connect attempt fails
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    Auth,
    Unreachable,
}

#[derive(Default)]
pub struct MockConnector {
    connects: DashMap<String, usize>,
    through_jump: DashMap<String, usize>,
    failures: DashMap<String, MockFailure>,
    transports: DashMap<String, Arc<MockTransport>>,
    routes: DashMap<String, Arc<RemoteForwardRegistry>>,
    delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, connection_id: &str, failure: MockFailure) {
        self.failures.insert(connection_id.to_string(), failure);
    }

    /// Make every handshake take `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connect_count(&self, connection_id: &str) -> usize {
        self.connects.get(connection_id).map(|c| *c).unwrap_or(0)
    }

    pub fn connects_through_jump(&self, connection_id: &str) -> usize {
        self.through_jump.get(connection_id).map(|c| *c).unwrap_or(0)
    }

    /// Most recent transport created for `connection_id`
    pub fn transport(&self, connection_id: &str) -> Option<Arc<MockTransport>> {
        self.transports.get(connection_id).map(|t| t.clone())
    }

    /// Forward routing table handed to the most recent session for `connection_id`
    pub fn routes(&self, connection_id: &str) -> Option<Arc<RemoteForwardRegistry>> {
        self.routes.get(connection_id).map(|r| r.clone())
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(
        &self,
        connection: &Connection,
        via: Option<Arc<dyn SshTransport>>,
        forwards: Arc<RemoteForwardRegistry>,
    ) -> Result<Arc<dyn SshTransport>, SshError> {
        *self.connects.entry(connection.id.clone()).or_insert(0) += 1;
        if let Some(parent) = via {
            if !parent.is_connected() {
                return Err(SshError::Disconnected);
            }
            *self.through_jump.entry(connection.id.clone()).or_insert(0) += 1;
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.failures.get(&connection.id).map(|f| *f) {
            return Err(match failure {
                MockFailure::Auth => {
                    SshError::AuthenticationFailed("Authentication rejected by server".into())
                }
                MockFailure::Unreachable => {
                    SshError::ConnectionFailed(format!("{}: connection refused", connection.host))
                }
            });
        }

        let transport = Arc::new(MockTransport::new());
        self.transports
            .insert(connection.id.clone(), transport.clone());
        self.routes.insert(connection.id.clone(), forwards);
        Ok(transport)
    }
}

/// Spawn a TCP echo server on an ephemeral loopback port
pub async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}
