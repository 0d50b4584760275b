//! SSH Session Pool
//!
//! One multiplexed SSH transport per connection id, shared by every tunnel and
//! interactive usage (terminal, file browser) of that connection.
//!
//! # Lifecycle
//!
//! - `acquire` reuses a live session or connects on demand. Concurrent
//!   acquires for the same id share a single in-flight connect.
//! - Every [`SessionHandle`] holds one reference. Releasing (or dropping) the
//!   last one starts an idle grace timer; the session is disconnected only if
//!   nobody re-acquires it before the timer fires.
//! - A connection with a jump host is established through a pooled session to
//!   the bastion, and holds a reference on it for as long as it lives.
//! - A session whose transport drops is removed from the pool; the next
//!   acquire reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::SessionConnector;
use super::config::{Connection, ConnectionProvider};
use super::error::ConnectError;
use super::transport::SshTransport;
use crate::forwarding::RemoteForwardRegistry;

/// Who holds a session reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum Usage {
    /// An active tunnel (tunnel id)
    Tunnel(String),
    /// A terminal or file browser (usage id chosen by the caller)
    Interactive(String),
    /// A session tunneled through this one (child connection id)
    JumpFor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Referenced by at least one usage
    Active,
    /// Unreferenced, waiting for the grace period to expire
    Idle,
    /// Torn down; the entry is no longer in the pool
    Disconnected,
}

/// Pool entry summary for UI and diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub connection_id: String,
    pub host: String,
    pub state: SessionState,
    pub ref_count: u32,
    pub tunnel_ids: Vec<String>,
    pub interactive_ids: Vec<String>,
    pub parent_connection_id: Option<String>,
    pub created_at: String,
}

struct EntryState {
    ref_count: u32,
    usages: Vec<Usage>,
    state: SessionState,
    idle_timer: Option<JoinHandle<()>>,
}

/// A pooled session
///
/// Reference count, usages, state and idle timer live under one lock so an
/// acquire can never revive an entry the idle timer already tore down.
pub struct SessionEntry {
    connection_id: String,
    host: String,
    transport: Arc<dyn SshTransport>,
    forwards: Arc<RemoteForwardRegistry>,
    /// Reference on the jump host session, dropped on teardown
    parent: Mutex<Option<SessionHandle>>,
    parent_connection_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    inner: Mutex<EntryState>,
}

impl SessionEntry {
    /// Add a reference. `None` if the entry was already torn down.
    fn attach(&self, usage: Usage) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return None;
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        inner.ref_count = inner.ref_count.saturating_add(1);
        inner.usages.push(usage);
        inner.state = SessionState::Active;
        Some(inner.ref_count)
    }

    /// Drop a reference, returning the remaining count.
    fn detach(&self, usage: &Usage) -> u32 {
        let mut inner = self.inner.lock();
        if inner.ref_count == 0 {
            warn!(
                "Session {} ref count already 0, not decrementing",
                self.connection_id
            );
            return 0;
        }
        inner.ref_count -= 1;
        if let Some(pos) = inner.usages.iter().position(|u| u == usage) {
            inner.usages.remove(pos);
        }
        if inner.ref_count == 0 && inner.state == SessionState::Active {
            inner.state = SessionState::Idle;
        }
        inner.ref_count
    }

    /// Mark the entry torn down. Returns false if it already was.
    fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return false;
        }
        inner.state = SessionState::Disconnected;
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        true
    }

    fn is_usable(&self) -> bool {
        self.inner.lock().state != SessionState::Disconnected && self.transport.is_connected()
    }

    fn ref_count(&self) -> u32 {
        self.inner.lock().ref_count
    }

    fn to_info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        let mut tunnel_ids = Vec::new();
        let mut interactive_ids = Vec::new();
        for usage in &inner.usages {
            match usage {
                Usage::Tunnel(id) => tunnel_ids.push(id.clone()),
                Usage::Interactive(id) => interactive_ids.push(id.clone()),
                Usage::JumpFor(_) => {}
            }
        }
        SessionInfo {
            connection_id: self.connection_id.clone(),
            host: self.host.clone(),
            state: inner.state,
            ref_count: inner.ref_count,
            tunnel_ids,
            interactive_ids,
            parent_connection_id: self.parent_connection_id.clone(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Opaque reference to a pooled session
///
/// Holding a handle keeps the session alive. Hand it back with
/// [`SshSessionPool::release`]; dropping it has the same effect.
pub struct SessionHandle {
    entry: Arc<SessionEntry>,
    usage: Usage,
    pool: Weak<PoolInner>,
    released: bool,
}

impl SessionHandle {
    pub fn connection_id(&self) -> &str {
        &self.entry.connection_id
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn is_connected(&self) -> bool {
        self.entry.is_usable()
    }

    pub(crate) fn transport(&self) -> Arc<dyn SshTransport> {
        self.entry.transport.clone()
    }

    pub(crate) fn forwards(&self) -> Arc<RemoteForwardRegistry> {
        self.entry.forwards.clone()
    }

    fn release_now(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let remaining = self.entry.detach(&self.usage);
        debug!(
            "Session {} released by {:?} (ref_count: {})",
            self.entry.connection_id, self.usage, remaining
        );
        if remaining == 0 {
            if let Some(pool) = self.pool.upgrade() {
                pool.start_idle_timer(&self.entry);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.entry.connection_id)
            .field("usage", &self.usage)
            .finish()
    }
}

type ConnectResult = Result<Arc<SessionEntry>, ConnectError>;
type PendingConnect = Shared<BoxFuture<'static, ConnectResult>>;

struct PoolInner {
    provider: Arc<dyn ConnectionProvider>,
    connector: Arc<dyn SessionConnector>,
    sessions: DashMap<String, Arc<SessionEntry>>,
    /// In-flight connects, one per connection id
    pending: DashMap<String, PendingConnect>,
    idle_grace: Duration,
    max_jump_hops: usize,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct SshSessionPool {
    inner: Arc<PoolInner>,
}

impl SshSessionPool {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        connector: Arc<dyn SessionConnector>,
        idle_grace: Duration,
        max_jump_hops: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                provider,
                connector,
                sessions: DashMap::new(),
                pending: DashMap::new(),
                idle_grace,
                max_jump_hops,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get a reference to the session for `connection_id`, connecting if needed.
    pub async fn acquire(
        &self,
        connection_id: &str,
        usage: Usage,
    ) -> Result<SessionHandle, ConnectError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::PoolClosed);
        }
        self.inner.acquire_handle(connection_id, usage).await
    }

    pub async fn acquire_for_tunnel(
        &self,
        connection_id: &str,
        tunnel_id: &str,
    ) -> Result<SessionHandle, ConnectError> {
        self.acquire(connection_id, Usage::Tunnel(tunnel_id.to_string()))
            .await
    }

    /// Reference held by a terminal or file browser, so idle cleanup counts it
    pub async fn acquire_interactive(
        &self,
        connection_id: &str,
        usage_id: &str,
    ) -> Result<SessionHandle, ConnectError> {
        self.acquire(connection_id, Usage::Interactive(usage_id.to_string()))
            .await
    }

    /// Give a reference back. The last release starts the idle grace timer.
    pub fn release(&self, mut handle: SessionHandle) {
        handle.release_now();
    }

    pub fn ref_count(&self, connection_id: &str) -> u32 {
        self.inner
            .sessions
            .get(connection_id)
            .map(|e| e.ref_count())
            .unwrap_or(0)
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.inner
            .sessions
            .get(connection_id)
            .map(|e| e.is_usable())
            .unwrap_or(false)
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().to_info())
            .collect();
        sessions.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Disconnect every pooled session regardless of references.
    pub async fn disconnect_all(&self) {
        let entries: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        info!("Disconnecting all {} pooled sessions", entries.len());
        for entry in entries {
            self.inner.teardown(&entry).await;
        }
    }

    /// Refuse further acquires and disconnect everything.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect_all().await;
    }
}

impl PoolInner {
    async fn acquire_handle(
        self: &Arc<Self>,
        connection_id: &str,
        usage: Usage,
    ) -> Result<SessionHandle, ConnectError> {
        loop {
            let entry = self.get_or_connect(connection_id.to_string()).await?;
            match entry.attach(usage.clone()) {
                Some(count) => {
                    debug!(
                        "Session {} acquired by {:?} (ref_count: {})",
                        connection_id, usage, count
                    );
                    return Ok(SessionHandle {
                        entry,
                        usage,
                        pool: Arc::downgrade(self),
                        released: false,
                    });
                }
                // Torn down between lookup and attach; look again
                None => continue,
            }
        }
    }

    fn get_or_connect(self: &Arc<Self>, connection_id: String) -> BoxFuture<'static, ConnectResult> {
        let this = self.clone();
        async move {
            if let Some(entry) = this.sessions.get(&connection_id).map(|e| e.clone()) {
                if entry.is_usable() {
                    return Ok(entry);
                }
                debug!("Session {} is dead, reconnecting", connection_id);
                this.teardown(&entry).await;
            }

            let pending = match this.pending.entry(connection_id.clone()) {
                Entry::Occupied(o) => {
                    debug!("Joining in-flight connect for {}", connection_id);
                    o.get().clone()
                }
                Entry::Vacant(v) => {
                    let connect = this.clone().connect(connection_id.clone()).boxed().shared();
                    v.insert(connect.clone());
                    connect
                }
            };
            pending.await
        }
        .boxed()
    }

    async fn connect(self: Arc<Self>, connection_id: String) -> ConnectResult {
        let result = self.establish(&connection_id).await;
        // The entry (if any) is already in `sessions`, so late callers find it there
        self.pending.remove(&connection_id);
        result
    }

    async fn establish(self: &Arc<Self>, connection_id: &str) -> ConnectResult {
        let connection = self.provider.get_connection(connection_id).ok_or_else(|| {
            ConnectError::UnknownConnection {
                connection_id: connection_id.to_string(),
            }
        })?;
        self.check_jump_chain(&connection)?;

        let parent = match &connection.jump_host_id {
            Some(jump_id) => Some(
                self.acquire_handle(jump_id, Usage::JumpFor(connection_id.to_string()))
                    .await
                    .map_err(ConnectError::through_jump)?,
            ),
            None => None,
        };

        let forwards = Arc::new(RemoteForwardRegistry::new());
        let transport = self
            .connector
            .connect(
                &connection,
                parent.as_ref().map(|p| p.transport()),
                forwards.clone(),
            )
            .await
            .map_err(|e| {
                warn!("Connect to {} failed: {}", connection.display_target(), e);
                ConnectError::from_ssh(connection_id, &connection.host, &e)
            })?;

        info!(
            "Session {} established ({})",
            connection_id,
            connection.display_target()
        );

        let entry = Arc::new(SessionEntry {
            connection_id: connection_id.to_string(),
            host: connection.host.clone(),
            transport,
            forwards,
            parent_connection_id: parent.as_ref().map(|p| p.connection_id().to_string()),
            parent: Mutex::new(parent),
            created_at: chrono::Utc::now(),
            inner: Mutex::new(EntryState {
                ref_count: 0,
                usages: Vec::new(),
                state: SessionState::Idle,
                idle_timer: None,
            }),
        });

        self.watch_disconnect(&entry);
        self.sessions
            .insert(connection_id.to_string(), entry.clone());
        // Nobody may attach (all callers gave up); the grace timer covers that
        self.start_idle_timer(&entry);
        Ok(entry)
    }

    /// Walk the jump host references without connecting, so a misconfigured
    /// cycle fails fast instead of waiting on its own in-flight connect.
    fn check_jump_chain(&self, connection: &Connection) -> Result<(), ConnectError> {
        let mut hops = 0;
        let mut next = connection.jump_host_id.clone();
        while let Some(jump_id) = next {
            hops += 1;
            if hops > self.max_jump_hops {
                return Err(ConnectError::JumpChainTooLong {
                    connection_id: connection.id.clone(),
                    max_hops: self.max_jump_hops,
                });
            }
            next = self
                .provider
                .get_connection(&jump_id)
                .and_then(|c| c.jump_host_id);
        }
        Ok(())
    }

    fn watch_disconnect(self: &Arc<Self>, entry: &Arc<SessionEntry>) {
        let mut disconnect_rx = entry.transport.subscribe_disconnect();
        let pool = Arc::downgrade(self);
        let entry = Arc::downgrade(entry);
        tokio::spawn(async move {
            let _ = disconnect_rx.recv().await;
            let (Some(pool), Some(entry)) = (pool.upgrade(), entry.upgrade()) else {
                return;
            };
            if entry.inner.lock().state != SessionState::Disconnected {
                warn!(
                    "Session {} lost its transport, removing from pool",
                    entry.connection_id
                );
            }
            pool.teardown(&entry).await;
        });
    }

    fn start_idle_timer(self: &Arc<Self>, entry: &Arc<SessionEntry>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let pool = Arc::downgrade(self);
        let timer_entry = entry.clone();
        let grace = self.idle_grace;

        let mut inner = entry.inner.lock();
        if inner.ref_count > 0 || inner.state == SessionState::Disconnected {
            return;
        }
        debug!(
            "Session {} idle, disconnecting in {}ms unless reused",
            entry.connection_id,
            grace.as_millis()
        );
        if let Some(previous) = inner.idle_timer.take() {
            previous.abort();
        }
        inner.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            {
                let mut inner = timer_entry.inner.lock();
                if inner.ref_count > 0 || inner.state == SessionState::Disconnected {
                    return;
                }
                // Claim teardown while still holding the lock
                inner.state = SessionState::Disconnected;
                inner.idle_timer = None;
            }
            info!(
                "Session {} idle grace expired, disconnecting",
                timer_entry.connection_id
            );
            pool.finish_teardown(&timer_entry).await;
        }));
    }

    async fn teardown(&self, entry: &Arc<SessionEntry>) {
        if entry.close() {
            self.finish_teardown(entry).await;
        }
    }

    async fn finish_teardown(&self, entry: &Arc<SessionEntry>) {
        self.sessions
            .remove_if(&entry.connection_id, |_, e| Arc::ptr_eq(e, entry));
        entry.transport.disconnect().await;
        // Drop the bastion reference last; it may start the bastion's own timer
        let parent = entry.parent.lock().take();
        drop(parent);
        info!("Session {} disconnected and removed", entry.connection_id);
    }
}
