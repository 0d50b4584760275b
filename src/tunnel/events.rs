//! Tunnel Event System
//!
//! Status changes are broadcast to subscribers (the UI layer). Delivery is
//! fire-and-forget: a subscriber that is not listening, or lags behind the
//! buffer, misses events and must reconcile through `list_all()`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{TunnelConfig, TunnelStatus};

/// Event name used by the UI bridge
pub const STATUS_CHANGE_EVENT: &str = "tunnel:status-change";
pub const CONFIG_CHANGE_EVENT: &str = "tunnel:config-change";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    StatusChanged {
        id: String,
        status: TunnelStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Persisted config rewritten by the engine (conflict remap or revert)
    ConfigChanged { config: TunnelConfig },
}

impl TunnelEvent {
    /// Name the UI bridge should emit this event under
    pub fn name(&self) -> &'static str {
        match self {
            TunnelEvent::StatusChanged { .. } => STATUS_CHANGE_EVENT,
            TunnelEvent::ConfigChanged { .. } => CONFIG_CHANGE_EVENT,
        }
    }

    pub fn tunnel_id(&self) -> &str {
        match self {
            TunnelEvent::StatusChanged { id, .. } => id,
            TunnelEvent::ConfigChanged { config } => &config.id,
        }
    }
}

#[derive(Clone)]
pub struct TunnelEventEmitter {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelEventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TunnelEvent) {
        // No receivers is normal before the UI subscribes
        if self.tx.send(event).is_err() {
            tracing::trace!("Tunnel event dropped, no subscribers");
        }
    }

    pub fn emit_status_changed(&self, id: &str, status: TunnelStatus) {
        let error = status.error_message().map(str::to_string);
        self.emit(TunnelEvent::StatusChanged {
            id: id.to_string(),
            status,
            error,
        });
    }

    pub fn emit_config_changed(&self, config: TunnelConfig) {
        self.emit(TunnelEvent::ConfigChanged { config });
    }
}

impl std::fmt::Debug for TunnelEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
