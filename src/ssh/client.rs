//! SSH Client implementation using russh
//!
//! [`RusshConnector`] turns a [`Connection`] record into a running transport,
//! either over TCP or nested inside a `direct-tcpip` channel of an already
//! established bastion session (SSH-over-SSH via `client::connect_stream`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::config::{expand_tilde, AuthMethod, Connection};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::transport::SshTransport;
use crate::config::EngineConfig;
use crate::forwarding::{IncomingChannel, RemoteForwardRegistry};

/// Establishes authenticated SSH transports
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect to `connection`, directly or through `via` (the bastion's
    /// transport). Forwarded-tcpip channels the server opens later are
    /// routed through `forwards`.
    async fn connect(
        &self,
        connection: &Connection,
        via: Option<Arc<dyn SshTransport>>,
        forwards: Arc<RemoteForwardRegistry>,
    ) -> Result<Arc<dyn SshTransport>, SshError>;
}

/// Transport settings shared by every connection the connector makes
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    /// Reject unknown host keys instead of learning them
    pub strict_host_key_checking: bool,
}

impl From<&EngineConfig> for ConnectorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            keepalive_max: config.keepalive_max,
            strict_host_key_checking: config.strict_host_key_checking,
        }
    }
}

/// Production connector backed by russh
pub struct RusshConnector {
    settings: ConnectorSettings,
    known_hosts: Arc<KnownHostsStore>,
}

impl RusshConnector {
    pub fn new(settings: ConnectorSettings, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            settings,
            known_hosts,
        }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            // Liveness comes from keepalives, not inactivity
            inactivity_timeout: None,
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: self.settings.keepalive_max,
            ..Default::default()
        })
    }

    /// Open the transport (TCP or a bastion channel), run the handshake and
    /// authenticate.
    async fn handshake(
        config: Arc<client::Config>,
        connection: &Connection,
        target: &str,
        via: Option<Arc<dyn SshTransport>>,
        handler: ClientHandler,
    ) -> Result<Handle<ClientHandler>, SshError> {
        let mut handle = match via {
            None => {
                info!("Connecting to SSH server at {}", target);
                client::connect(config, (connection.host.as_str(), connection.port), handler)
                    .await
                    .map_err(handshake_error)?
            }
            Some(parent) => {
                info!("Connecting to {} through jump host (SSH-over-SSH)", target);
                let stream = parent
                    .open_direct_tcpip(&connection.host, connection.port)
                    .await?;
                client::connect_stream(config, stream, handler)
                    .await
                    .map_err(handshake_error)?
            }
        };

        debug!("SSH handshake with {} completed", target);
        Self::authenticate(&mut handle, connection).await?;
        Ok(handle)
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        connection: &Connection,
    ) -> Result<(), SshError> {
        let authenticated = match &connection.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&connection.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::PrivateKey {
                key_path,
                passphrase,
            } => {
                let key_path = expand_tilde(key_path);
                debug!("Authenticating {} with key {}", connection.id, key_path);
                let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&connection.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "Authentication to {} rejected by server",
                connection.host
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(
        &self,
        connection: &Connection,
        via: Option<Arc<dyn SshTransport>>,
        forwards: Arc<RemoteForwardRegistry>,
    ) -> Result<Arc<dyn SshTransport>, SshError> {
        let target = connection.display_target();
        let handler = ClientHandler::new(
            connection.host.clone(),
            connection.port,
            self.settings.strict_host_key_checking,
            self.known_hosts.clone(),
            forwards,
        );
        let config = self.client_config();
        let timeout = self.settings.connect_timeout;

        // Channel open, handshake and auth share one deadline
        let handle = tokio::time::timeout(
            timeout,
            Self::handshake(config, connection, &target, via, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", target)))??;
        info!("SSH authentication successful for {}", target);

        let (disconnect_tx, _) = broadcast::channel(4);
        let controller = spawn_handle_owner_task(handle, connection.id.clone(), disconnect_tx);
        Ok(Arc::new(controller))
    }
}

/// Host key verdicts from `check_server_key` pass through untouched, so a
/// changed key is never reported as a network failure.
fn handshake_error(err: SshError) -> SshError {
    match err {
        SshError::HostKeyRejected(_) => err,
        other => SshError::ConnectionFailed(other.to_string()),
    }
}

/// Client handler for russh callbacks
///
/// This handler processes server-initiated events, including:
/// - Host key verification against ~/.ssh/known_hosts
/// - Remote port forwarding (forwarded-tcpip channels)
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject unknown keys
    /// - false: learn unknown keys (changed keys are always rejected)
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
    forwards: Arc<RemoteForwardRegistry>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        strict: bool,
        known_hosts: Arc<KnownHostsStore>,
        forwards: Arc<RemoteForwardRegistry>,
    ) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
            forwards,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if self.strict => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} ({}). Add it to known_hosts or disable strict mode.",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self.known_hosts.add_host(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {}). \
                     If the change is legitimate, remove the old key from known_hosts.",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }

    /// Called when the server opens a channel for a new remote port forwarding connection.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let incoming = IncomingChannel {
            stream: Box::new(Box::pin(channel.into_stream())),
            originator: format!("{}:{}", originator_address, originator_port),
        };
        // Unclaimed channels are dropped, which closes them on the server
        if self
            .forwards
            .dispatch(connected_address, connected_port as u16, incoming)
            .is_err()
        {
            warn!(
                "No listener for forwarded connection {}:{}",
                connected_address, connected_port
            );
        }
        Ok(())
    }
}
