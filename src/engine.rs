//! Engine wiring
//!
//! `TunnelEngine` owns the connection book, the session pool, the tunnel
//! registry and the supervisor. The UI collaborator holds one engine and
//! calls into it through `commands`.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{tunnels_db_file, ConfigStorage, EngineConfig, StorageError};
use crate::ssh::{
    ConnectionBook, ConnectorSettings, KnownHostsStore, RusshConnector, SessionConnector,
    SshSessionPool,
};
use crate::tunnel::{
    RegistryError, SupervisorSettings, TunnelEvent, TunnelEventEmitter, TunnelRegistry,
    TunnelSupervisor,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] StorageError),

    #[error("Tunnel registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub struct TunnelEngine {
    config: EngineConfig,
    connections: Arc<ConnectionBook>,
    supervisor: TunnelSupervisor,
}

impl TunnelEngine {
    /// Load `~/.oxidetunnel/engine.json` and open the tunnel database next to it
    pub async fn open_default() -> Result<Self, EngineError> {
        let config = ConfigStorage::new()?.load().await?;
        let db_path = tunnels_db_file()?;
        Self::open(config, db_path)
    }

    /// Engine connecting over real SSH
    pub fn open(config: EngineConfig, db_path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let known_hosts = Arc::new(KnownHostsStore::new());
        let connector = Arc::new(RusshConnector::new(
            ConnectorSettings::from(&config),
            known_hosts,
        ));
        Self::with_connector(config, db_path, connector)
    }

    pub fn with_connector(
        config: EngineConfig,
        db_path: impl AsRef<Path>,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(TunnelRegistry::open(db_path)?);
        let connections = Arc::new(ConnectionBook::new());
        let pool = SshSessionPool::new(
            connections.clone(),
            connector,
            config.idle_grace(),
            config.max_jump_hops,
        );
        let supervisor = TunnelSupervisor::new(
            registry,
            pool,
            TunnelEventEmitter::new(config.event_capacity),
            SupervisorSettings::from(&config),
        );

        info!(
            "Tunnel engine ready (idle grace {}ms, max {} jump hops)",
            config.idle_grace_ms, config.max_jump_hops
        );
        Ok(Self {
            config,
            connections,
            supervisor,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connection records the engine resolves ids against
    pub fn connections(&self) -> &Arc<ConnectionBook> {
        &self.connections
    }

    pub fn supervisor(&self) -> &TunnelSupervisor {
        &self.supervisor
    }

    pub fn pool(&self) -> &SshSessionPool {
        self.supervisor.pool()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.supervisor.subscribe()
    }

    /// Start `auto_start` tunnels in the background, shortly after load.
    pub fn spawn_auto_start(&self) -> JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let delay = self.config.autostart_stagger();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match supervisor.start_auto_tunnels().await {
                Ok(summary) if summary.succeeded + summary.failed > 0 => info!(
                    "Auto-start finished: {} started, {} failed",
                    summary.succeeded, summary.failed
                ),
                Ok(_) => {}
                Err(e) => warn!("Auto-start skipped: {}", e),
            }
        })
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
