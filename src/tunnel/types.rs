//! Tunnel configuration and runtime status types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::forwarding::ForwardStats;

/// Which end listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelDirection {
    /// A local socket relays to `remote_host:remote_port` through SSH
    Local,
    /// The SSH server listens on `remote_port` and relays back to `remote_host:local_port`
    Remote,
}

/// Persisted tunnel definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub id: String,
    pub connection_id: String,
    pub name: String,
    pub direction: TunnelDirection,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    /// Listen address. Client side for local tunnels, server side for remote
    /// ones ("0.0.0.0" exposes the forward publicly).
    pub bind_address: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Port the user asked for before a conflict remap; restored on stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_port: Option<u16>,
}

impl TunnelConfig {
    pub fn local(
        connection_id: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let remote_host = remote_host.into();
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            name: format!("L {} -> {}:{}", local_port, remote_host, remote_port),
            direction: TunnelDirection::Local,
            local_port,
            remote_host,
            remote_port,
            bind_address: "127.0.0.1".to_string(),
            auto_start: false,
            group: None,
            original_port: None,
        }
    }

    pub fn remote(
        connection_id: impl Into<String>,
        remote_port: u16,
        remote_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        let remote_host = remote_host.into();
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            name: format!("R {} -> {}:{}", remote_port, remote_host, local_port),
            direction: TunnelDirection::Remote,
            local_port,
            remote_host,
            remote_port,
            bind_address: "127.0.0.1".to_string(),
            auto_start: false,
            group: None,
            original_port: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// The port this tunnel asks to listen on
    pub fn listen_port(&self) -> u16 {
        match self.direction {
            TunnelDirection::Local => self.local_port,
            TunnelDirection::Remote => self.remote_port,
        }
    }

    pub(crate) fn set_listen_port(&mut self, port: u16) {
        match self.direction {
            TunnelDirection::Local => self.local_port = port,
            TunnelDirection::Remote => self.remote_port = port,
        }
    }

    /// Record a conflict remap. The first requested port is kept if the
    /// tunnel was already remapped.
    pub(crate) fn remap(&mut self, port: u16) {
        if self.original_port.is_none() {
            self.original_port = Some(self.listen_port());
        }
        self.set_listen_port(port);
    }

    /// Undo a conflict remap. Returns whether anything changed.
    pub(crate) fn revert_remap(&mut self) -> bool {
        match self.original_port.take() {
            Some(port) => {
                self.set_listen_port(port);
                true
            }
            None => false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("tunnel id must not be empty".to_string());
        }
        if self.connection_id.trim().is_empty() {
            return Err("connection id must not be empty".to_string());
        }
        // u16 caps at 65535, zero is the only out-of-range value
        if self.local_port == 0 {
            return Err("localPort must be in 1..=65535".to_string());
        }
        if self.remote_port == 0 {
            return Err("remotePort must be in 1..=65535".to_string());
        }
        if self.original_port == Some(0) {
            return Err("originalPort must be in 1..=65535".to_string());
        }
        if self.remote_host.trim().is_empty() {
            return Err("remoteHost must not be empty".to_string());
        }
        if self.bind_address.trim().is_empty() {
            return Err("bindAddress must not be empty".to_string());
        }
        Ok(())
    }
}

/// Runtime status of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "camelCase")]
pub enum TunnelStatus {
    Stopped,
    Starting,
    Active,
    Error(String),
}

impl TunnelStatus {
    pub fn error_message(&self) -> Option<&str> {
        match self {
            TunnelStatus::Error(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Active)
    }
}

/// Mutable per-tunnel state, never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRuntimeState {
    pub status: TunnelStatus,
    /// Port actually listened on while active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ForwardStats>,
}

impl Default for TunnelRuntimeState {
    fn default() -> Self {
        Self {
            status: TunnelStatus::Stopped,
            bound_port: None,
            stats: None,
        }
    }
}

/// Configuration merged with runtime state, as handed to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelView {
    #[serde(flatten)]
    pub config: TunnelConfig,
    #[serde(flatten)]
    pub runtime: TunnelRuntimeState,
}

/// A requested port is taken; `suggested` was free when checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConflict {
    pub requested: u16,
    pub suggested: u16,
}

/// Outcome of a group start/stop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group: String,
    pub succeeded: usize,
    pub failed: usize,
    /// `(tunnel id, error message)` per failure
    pub failures: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_keeps_first_requested_port() {
        let mut config = TunnelConfig::local("conn-1", 8080, "127.0.0.1", 80);
        config.remap(8081);
        config.remap(8082);
        assert_eq!(config.local_port, 8082);
        assert_eq!(config.original_port, Some(8080));

        assert!(config.revert_remap());
        assert_eq!(config.local_port, 8080);
        assert_eq!(config.original_port, None);
        assert!(!config.revert_remap());
    }

    #[test]
    fn test_remote_remap_touches_remote_port() {
        let mut config = TunnelConfig::remote("conn-1", 9000, "localhost", 3000);
        config.remap(9001);
        assert_eq!(config.remote_port, 9001);
        assert_eq!(config.local_port, 3000);
        assert_eq!(config.original_port, Some(9000));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut config = TunnelConfig::local("conn-1", 0, "127.0.0.1", 80);
        assert!(config.validate().is_err());
        config.local_port = 1;
        assert!(config.validate().is_ok());
        config.remote_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_view_serialization() {
        let config = TunnelConfig::local("conn-1", 8080, "db.internal", 5432).with_group("dev");
        let view = TunnelView {
            config,
            runtime: TunnelRuntimeState {
                status: TunnelStatus::Error("boom".into()),
                bound_port: None,
                stats: None,
            },
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["localPort"], 8080);
        assert_eq!(json["direction"], "local");
        assert_eq!(json["group"], "dev");
        assert_eq!(json["status"]["state"], "error");
        assert_eq!(json["status"]["message"], "boom");
    }
}
