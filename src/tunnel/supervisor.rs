//! Tunnel Supervisor
//!
//! Single entry point for starting and stopping tunnels and the only place a
//! forward listener is created. Start and stop are serialized per tunnel id;
//! different tunnels proceed independently. Each active tunnel holds one
//! pooled session reference and one listener, plus a monitor task that turns
//! an unexpected listener exit (session loss, socket failure) into an `Error`
//! status.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use super::events::{TunnelEvent, TunnelEventEmitter};
use super::registry::TunnelRegistry;
use super::types::{
    GroupSummary, PortConflict, TunnelConfig, TunnelDirection, TunnelRuntimeState, TunnelStatus,
    TunnelView,
};
use crate::config::EngineConfig;
use crate::forwarding::probe::candidates;
use crate::forwarding::{
    probe_remote_port, start_local_forward, start_remote_forward, ForwardError, ListenerHandle,
    ListenerState, LocalForward, PortProbe, RemoteForward,
};
use crate::ssh::{SessionHandle, SshSessionPool};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Bound on tearing down a listener and its relays
    pub stop_timeout: Duration,
    pub relay_idle_timeout: Duration,
    pub autostart_stagger: Duration,
    pub probe_attempts: u16,
}

impl From<&EngineConfig> for SupervisorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout(),
            relay_idle_timeout: config.relay_idle_timeout(),
            autostart_stagger: config.autostart_stagger(),
            probe_attempts: config.probe_attempts,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

struct ActiveTunnel {
    /// Distinguishes this run from a later restart of the same id
    generation: u64,
    listener: Arc<ListenerHandle>,
    /// Dropping it releases the pooled session reference
    _session: SessionHandle,
    monitor: JoinHandle<()>,
}

struct SupervisorInner {
    registry: Arc<TunnelRegistry>,
    pool: SshSessionPool,
    events: TunnelEventEmitter,
    settings: SupervisorSettings,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    active: DashMap<String, ActiveTunnel>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<SupervisorInner>,
}

impl TunnelSupervisor {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        pool: SshSessionPool,
        events: TunnelEventEmitter,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                pool,
                events,
                settings,
                locks: DashMap::new(),
                active: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &SshSessionPool {
        &self.inner.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Number of tunnels with a running listener
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Insert or replace a config. A running tunnel picks up the change on
    /// its next start.
    pub fn save(&self, config: TunnelConfig) -> Result<TunnelConfig, TunnelError> {
        self.inner.registry.save(&config)?;
        Ok(config)
    }

    /// Start a tunnel. A port conflict comes back as
    /// [`TunnelError::PortConflict`] and leaves the tunnel stopped.
    pub async fn start(&self, tunnel_id: &str) -> Result<TunnelView, TunnelError> {
        let lock = self.inner.lock_for(tunnel_id);
        let _guard = lock.lock().await;
        self.inner.start_locked(tunnel_id).await
    }

    /// Accept a conflict suggestion (or a custom port): listen on `port`
    /// instead, remembering the port originally asked for, and start.
    pub async fn start_with_port(
        &self,
        tunnel_id: &str,
        port: u16,
    ) -> Result<TunnelView, TunnelError> {
        if port == 0 {
            return Err(TunnelError::InvalidConfig {
                message: "port must be in 1..=65535".to_string(),
            });
        }

        let lock = self.inner.lock_for(tunnel_id);
        let _guard = lock.lock().await;

        let mut config = self.inner.registry.get(tunnel_id)?;
        if config.listen_port() != port {
            if self.inner.teardown_active(tunnel_id).await {
                info!("Restarting tunnel {} on port {}", tunnel_id, port);
            }
            config.remap(port);
            if config.original_port == Some(port) {
                config.original_port = None;
            }
            self.inner.registry.save(&config)?;
            info!(
                "Tunnel {} remapped to port {} (originally {:?})",
                tunnel_id, port, config.original_port
            );
            self.inner.events.emit_config_changed(config);
        }

        self.inner.start_locked(tunnel_id).await
    }

    /// Stop a tunnel and revert a conflict remap. Stopping a tunnel that is
    /// not running succeeds. Returns the config as persisted afterwards.
    pub async fn stop(&self, tunnel_id: &str) -> Result<TunnelConfig, TunnelError> {
        let lock = self.inner.lock_for(tunnel_id);
        let _guard = lock.lock().await;
        self.inner.stop_locked(tunnel_id).await
    }

    /// Stop (if running) and remove a tunnel
    pub async fn delete(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        let lock = self.inner.lock_for(tunnel_id);
        {
            let _guard = lock.lock().await;
            self.inner.teardown_active(tunnel_id).await;
            self.inner.registry.delete(tunnel_id)?;
        }
        self.inner.locks.remove(tunnel_id);
        Ok(())
    }

    /// Start every tunnel in `group`, one after another
    pub async fn start_group(&self, group: &str) -> Result<GroupSummary, TunnelError> {
        let tunnels = self.inner.registry.list_by_group(group)?;
        let mut summary = GroupSummary {
            group: group.to_string(),
            ..Default::default()
        };

        for view in tunnels {
            let id = view.config.id;
            match self.start(&id).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    warn!("Group {}: tunnel {} failed to start: {}", group, id, e);
                    summary.failed += 1;
                    summary.failures.push((id, e.to_string()));
                }
            }
        }

        info!(
            "Group {} started: {} succeeded, {} failed",
            group, summary.succeeded, summary.failed
        );
        Ok(summary)
    }

    pub async fn stop_group(&self, group: &str) -> Result<GroupSummary, TunnelError> {
        let tunnels = self.inner.registry.list_by_group(group)?;
        let mut summary = GroupSummary {
            group: group.to_string(),
            ..Default::default()
        };

        for view in tunnels {
            let id = view.config.id;
            match self.stop(&id).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    warn!("Group {}: tunnel {} failed to stop: {}", group, id, e);
                    summary.failed += 1;
                    summary.failures.push((id, e.to_string()));
                }
            }
        }

        info!(
            "Group {} stopped: {} succeeded, {} failed",
            group, summary.succeeded, summary.failed
        );
        Ok(summary)
    }

    /// Start every `auto_start` tunnel, sequentially with a short pause in
    /// between so a host is not hit by a burst of handshakes.
    pub async fn start_auto_tunnels(&self) -> Result<GroupSummary, TunnelError> {
        let configs: Vec<TunnelConfig> = self
            .inner
            .registry
            .configs()?
            .into_iter()
            .filter(|c| c.auto_start)
            .collect();

        let mut summary = GroupSummary {
            group: "autoStart".to_string(),
            ..Default::default()
        };
        if configs.is_empty() {
            return Ok(summary);
        }

        info!("Auto-starting {} tunnels", configs.len());
        for (i, config) in configs.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inner.settings.autostart_stagger).await;
            }
            match self.start(&config.id).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    warn!("Auto-start of tunnel {} failed: {}", config.id, e);
                    summary.failed += 1;
                    summary.failures.push((config.id, e.to_string()));
                }
            }
        }
        Ok(summary)
    }

    /// Every tunnel with its runtime state and live counters
    pub fn list_all(&self) -> Result<Vec<TunnelView>, TunnelError> {
        let views = self.inner.registry.list_all()?;
        Ok(self.inner.with_stats(views))
    }

    pub fn list_by_connection(&self, connection_id: &str) -> Result<Vec<TunnelView>, TunnelError> {
        let views = self.inner.registry.list_by_connection(connection_id)?;
        Ok(self.inner.with_stats(views))
    }

    pub fn get(&self, tunnel_id: &str) -> Result<TunnelView, TunnelError> {
        let mut view = self.inner.registry.get_view(tunnel_id)?;
        self.inner.attach_stats(&mut view);
        Ok(view)
    }

    /// Sweep listeners that ended without their exit being recorded, then
    /// return the authoritative view.
    pub async fn reconcile(&self) -> Result<Vec<TunnelView>, TunnelError> {
        let dead: Vec<(String, u64, ListenerState)> = self
            .inner
            .active
            .iter()
            .filter_map(|entry| {
                let state = entry.listener.state();
                (!state.is_active()).then(|| (entry.key().clone(), entry.generation, state))
            })
            .collect();

        for (id, generation, state) in dead {
            debug!("Reconcile: tunnel {} listener is {:?}", id, state);
            self.inner.handle_listener_exit(&id, generation, state).await;
        }

        self.list_all()
    }

    /// Stop every running tunnel and close the session pool.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .active
            .iter()
            .map(|e| e.key().clone())
            .collect();
        info!("Shutting down {} active tunnels", ids.len());

        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("Failed to stop tunnel {} during shutdown: {}", id, e);
            }
        }
        self.inner.pool.close().await;
    }
}

impl SupervisorInner {
    fn lock_for(&self, tunnel_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn start_locked(self: &Arc<Self>, tunnel_id: &str) -> Result<TunnelView, TunnelError> {
        let config = self.registry.get(tunnel_id)?;
        config
            .validate()
            .map_err(|message| TunnelError::InvalidConfig { message })?;

        let running = self
            .active
            .get(tunnel_id)
            .map(|a| a.listener.state().is_active());
        match running {
            Some(true) => {
                debug!("Tunnel {} already active", tunnel_id);
                return Ok(self.registry.get_view(tunnel_id)?);
            }
            // Listener died and its monitor has not recorded it yet
            Some(false) => {
                self.teardown_active(tunnel_id).await;
            }
            None => {}
        }

        info!("Starting tunnel {} ({})", tunnel_id, config.name);
        self.set_status(tunnel_id, TunnelStatus::Starting, None);

        let session = match self
            .pool
            .acquire_for_tunnel(&config.connection_id, tunnel_id)
            .await
        {
            Ok(session) => session,
            Err(e) => return Err(self.fail_start(tunnel_id, e.into())),
        };

        let listener = match self.open_listener(&config, &session).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                drop(session);
                return Err(self.fail_start(tunnel_id, e));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let bound_port = listener.bound_port();
        let monitor = tokio::spawn(monitor_listener(
            Arc::downgrade(self),
            tunnel_id.to_string(),
            generation,
            listener.clone(),
        ));

        info!("Tunnel {} active: {}", tunnel_id, listener.description());
        self.active.insert(
            tunnel_id.to_string(),
            ActiveTunnel {
                generation,
                listener,
                _session: session,
                monitor,
            },
        );
        self.set_status(tunnel_id, TunnelStatus::Active, Some(bound_port));

        Ok(self.registry.get_view(tunnel_id)?)
    }

    /// Bind the listener for `config`, turning a busy port into a
    /// [`PortConflict`] with a suggestion.
    async fn open_listener(
        &self,
        config: &TunnelConfig,
        session: &SessionHandle,
    ) -> Result<ListenerHandle, TunnelError> {
        let idle_timeout = self.settings.relay_idle_timeout;

        match config.direction {
            TunnelDirection::Local => {
                let probe = PortProbe::new(config.bind_address.clone(), self.settings.probe_attempts);
                if !probe.is_available(config.local_port) {
                    return Err(self.local_conflict(&probe, config.local_port));
                }

                let forward = LocalForward::new(
                    config.bind_address.clone(),
                    config.local_port,
                    config.remote_host.clone(),
                    config.remote_port,
                );
                match start_local_forward(session.transport(), forward, idle_timeout).await {
                    Ok(listener) => Ok(listener),
                    // Taken between the probe and the bind
                    Err(ForwardError::PortInUse { port, .. }) => {
                        Err(self.local_conflict(&probe, port))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            TunnelDirection::Remote => {
                let forward = RemoteForward::new(
                    config.bind_address.clone(),
                    config.remote_port,
                    config.remote_host.clone(),
                    config.local_port,
                );
                match start_remote_forward(
                    session.transport(),
                    session.forwards(),
                    forward,
                    idle_timeout,
                )
                .await
                {
                    Ok(listener) => Ok(listener),
                    Err(ForwardError::RemoteRejected {
                        address,
                        port,
                        reason,
                    }) => Err(self.remote_conflict(session, &address, port, reason).await),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn local_conflict(&self, probe: &PortProbe, port: u16) -> TunnelError {
        let held: HashSet<u16> = self
            .active
            .iter()
            .map(|a| a.listener.bound_port())
            .collect();

        match probe.suggest_alternative_excluding(port, |candidate| held.contains(&candidate)) {
            Some(suggested) => {
                info!("Local port {} busy, suggesting {}", port, suggested);
                TunnelError::PortConflict(PortConflict {
                    requested: port,
                    suggested,
                })
            }
            None => TunnelError::Forward(ForwardError::PortInUse {
                address: probe.bind_address().to_string(),
                port,
            }),
        }
    }

    /// The server refused `address:port`. Find the next port it accepts by
    /// requesting and immediately cancelling forwards.
    async fn remote_conflict(
        &self,
        session: &SessionHandle,
        address: &str,
        port: u16,
        reason: String,
    ) -> TunnelError {
        let transport = session.transport();
        for candidate in candidates(port, self.settings.probe_attempts) {
            if probe_remote_port(transport.as_ref(), address, candidate).await {
                info!("Remote port {} refused, suggesting {}", port, candidate);
                return TunnelError::PortConflict(PortConflict {
                    requested: port,
                    suggested: candidate,
                });
            }
            if !transport.is_connected() {
                return TunnelError::SessionLost;
            }
        }

        warn!(
            "Server refused remote forwarding on {} and every candidate after {}",
            address, port
        );
        TunnelError::Forward(ForwardError::ChannelRejected { reason })
    }

    /// Record a failed start. Conflicts leave the tunnel stopped since they
    /// are a question for the caller, not a fault.
    fn fail_start(&self, tunnel_id: &str, err: TunnelError) -> TunnelError {
        if err.is_recoverable() {
            self.registry.clear_runtime(tunnel_id);
            self.events
                .emit_status_changed(tunnel_id, TunnelStatus::Stopped);
        } else {
            warn!("Tunnel {} failed to start: {}", tunnel_id, err);
            self.set_status(tunnel_id, TunnelStatus::Error(err.to_string()), None);
        }
        err
    }

    async fn stop_locked(&self, tunnel_id: &str) -> Result<TunnelConfig, TunnelError> {
        let mut config = self.registry.get(tunnel_id)?;
        let previous = self.registry.runtime_state(tunnel_id).status;
        let was_running = self.teardown_active(tunnel_id).await;

        if config.revert_remap() {
            self.registry.save(&config)?;
            info!(
                "Tunnel {} reverted to its original port {}",
                tunnel_id,
                config.listen_port()
            );
            self.events.emit_config_changed(config.clone());
        }

        self.registry.clear_runtime(tunnel_id);
        if was_running || previous != TunnelStatus::Stopped {
            self.events
                .emit_status_changed(tunnel_id, TunnelStatus::Stopped);
        }
        info!("Tunnel {} stopped", tunnel_id);
        Ok(config)
    }

    /// Stop the listener and release the session. Returns false if nothing
    /// was running.
    async fn teardown_active(&self, tunnel_id: &str) -> bool {
        let Some((_, active)) = self.active.remove(tunnel_id) else {
            return false;
        };
        active.monitor.abort();
        active.listener.stop(self.settings.stop_timeout).await;
        drop(active);
        true
    }

    async fn handle_listener_exit(&self, tunnel_id: &str, generation: u64, state: ListenerState) {
        let message = match state {
            ListenerState::SessionLost => "SSH session lost".to_string(),
            ListenerState::Failed(reason) => reason,
            ListenerState::Active | ListenerState::Stopped => return,
        };

        let lock = self.lock_for(tunnel_id);
        let _guard = lock.lock().await;
        let Some((_, active)) = self
            .active
            .remove_if(tunnel_id, |_, a| a.generation == generation)
        else {
            return;
        };
        drop(active);

        warn!("Tunnel {} went down: {}", tunnel_id, message);
        self.set_status(tunnel_id, TunnelStatus::Error(message), None);
    }

    fn set_status(&self, tunnel_id: &str, status: TunnelStatus, bound_port: Option<u16>) {
        self.registry.set_runtime(
            tunnel_id,
            TunnelRuntimeState {
                status: status.clone(),
                bound_port,
                stats: None,
            },
        );
        self.events.emit_status_changed(tunnel_id, status);
    }

    fn attach_stats(&self, view: &mut TunnelView) {
        if let Some(active) = self.active.get(&view.config.id) {
            view.runtime.stats = Some(active.listener.stats());
        }
    }

    fn with_stats(&self, mut views: Vec<TunnelView>) -> Vec<TunnelView> {
        for view in &mut views {
            self.attach_stats(view);
        }
        views
    }
}

async fn monitor_listener(
    supervisor: Weak<SupervisorInner>,
    tunnel_id: String,
    generation: u64,
    listener: Arc<ListenerHandle>,
) {
    let state = listener.closed().await;
    drop(listener);
    if let Some(supervisor) = supervisor.upgrade() {
        supervisor
            .handle_listener_exit(&tunnel_id, generation, state)
            .await;
    }
}
