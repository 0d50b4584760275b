//! Tunnel commands
//!
//! The command surface the UI collaborator calls. Every command takes the
//! shared [`TunnelEngine`]; failures come back as a serializable
//! [`CommandError`] carrying the structured [`TunnelError`].

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::TunnelEngine;
use crate::ssh::SessionInfo;
use crate::tunnel::{GroupSummary, TunnelConfig, TunnelError, TunnelView};

/// Error returned by commands.
///
/// `tunnel_id` is set when the command created a tunnel before failing, so
/// the caller can accept a suggested port for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{error}")]
pub struct CommandError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(flatten)]
    pub error: TunnelError,
}

impl CommandError {
    fn for_tunnel(tunnel_id: &str, error: TunnelError) -> Self {
        Self {
            tunnel_id: Some(tunnel_id.to_string()),
            error,
        }
    }
}

impl From<TunnelError> for CommandError {
    fn from(error: TunnelError) -> Self {
        Self {
            tunnel_id: None,
            error,
        }
    }
}

/// Insert or update a tunnel. An empty id gets a fresh one.
pub fn tunnel_save(
    engine: &TunnelEngine,
    mut config: TunnelConfig,
) -> Result<TunnelConfig, CommandError> {
    if config.id.trim().is_empty() {
        config.id = Uuid::new_v4().to_string();
    }
    info!("Saving tunnel {} ({})", config.id, config.name);
    Ok(engine.supervisor().save(config)?)
}

/// Every tunnel merged with its runtime status
pub fn tunnel_get_all(engine: &TunnelEngine) -> Result<Vec<TunnelView>, CommandError> {
    Ok(engine.supervisor().list_all()?)
}

pub fn tunnel_get_by_connection(
    engine: &TunnelEngine,
    connection_id: &str,
) -> Result<Vec<TunnelView>, CommandError> {
    Ok(engine.supervisor().list_by_connection(connection_id)?)
}

/// Start a saved tunnel
pub async fn tunnel_start(
    engine: &TunnelEngine,
    tunnel_id: &str,
) -> Result<TunnelView, CommandError> {
    engine
        .supervisor()
        .start(tunnel_id)
        .await
        .map_err(|e| CommandError::for_tunnel(tunnel_id, e))
}

/// Create and start a local forward `localPort -> remoteHost:remotePort`
pub async fn tunnel_start_local(
    engine: &TunnelEngine,
    connection_id: &str,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Result<TunnelView, CommandError> {
    let config = TunnelConfig::local(connection_id, local_port, remote_host, remote_port);
    create_and_start(engine, config).await
}

/// Create and start a remote forward: the server listens on `remotePort`
/// and relays to `remoteHost:localPort` as seen from this machine.
pub async fn tunnel_start_remote(
    engine: &TunnelEngine,
    connection_id: &str,
    remote_port: u16,
    remote_host: &str,
    local_port: u16,
) -> Result<TunnelView, CommandError> {
    let config = TunnelConfig::remote(connection_id, remote_port, remote_host, local_port);
    create_and_start(engine, config).await
}

async fn create_and_start(
    engine: &TunnelEngine,
    config: TunnelConfig,
) -> Result<TunnelView, CommandError> {
    let config = tunnel_save(engine, config)?;
    tunnel_start(engine, &config.id).await
}

/// Accept a suggested (or custom) port after a conflict and start
pub async fn tunnel_start_with_port(
    engine: &TunnelEngine,
    tunnel_id: &str,
    port: u16,
) -> Result<TunnelView, CommandError> {
    engine
        .supervisor()
        .start_with_port(tunnel_id, port)
        .await
        .map_err(|e| CommandError::for_tunnel(tunnel_id, e))
}

pub async fn tunnel_stop(engine: &TunnelEngine, tunnel_id: &str) -> Result<(), CommandError> {
    engine
        .supervisor()
        .stop(tunnel_id)
        .await
        .map(|_| ())
        .map_err(|e| CommandError::for_tunnel(tunnel_id, e))
}

pub async fn tunnel_delete(engine: &TunnelEngine, tunnel_id: &str) -> Result<(), CommandError> {
    engine
        .supervisor()
        .delete(tunnel_id)
        .await
        .map_err(|e| CommandError::for_tunnel(tunnel_id, e))
}

pub async fn tunnel_start_group(
    engine: &TunnelEngine,
    group: &str,
) -> Result<GroupSummary, CommandError> {
    Ok(engine.supervisor().start_group(group).await?)
}

pub async fn tunnel_stop_group(
    engine: &TunnelEngine,
    group: &str,
) -> Result<GroupSummary, CommandError> {
    Ok(engine.supervisor().stop_group(group).await?)
}

/// Authoritative state after sweeping listeners that died silently
pub async fn tunnel_reconcile(engine: &TunnelEngine) -> Result<Vec<TunnelView>, CommandError> {
    Ok(engine.supervisor().reconcile().await?)
}

/// Pooled SSH sessions and who holds them
pub fn tunnel_list_sessions(engine: &TunnelEngine) -> Vec<SessionInfo> {
    engine.pool().list_sessions()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ssh::mock::{spawn_echo_server, MockConnector};
    use crate::ssh::{AuthMethod, Connection};
    use crate::tunnel::{PortConflict, TunnelStatus};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine() -> (TunnelEngine, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            idle_grace_ms: 100,
            ..Default::default()
        };
        let engine = TunnelEngine::with_connector(
            config,
            dir.path().join("tunnels.redb"),
            Arc::new(MockConnector::new()),
        )
        .unwrap();
        engine.connections().upsert(Connection::new(
            "db",
            "db.example",
            "deploy",
            AuthMethod::password("pw"),
        ));
        (engine, dir)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_save_assigns_id() {
        let (engine, _dir) = engine();
        let mut config = TunnelConfig::local("db", 8080, "127.0.0.1", 80);
        config.id = String::new();

        let saved = tunnel_save(&engine, config).unwrap();
        assert!(!saved.id.is_empty());
        assert_eq!(tunnel_get_all(&engine).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_local_conflict_accept_and_revert() {
        let (engine, _dir) = engine();
        let echo_port = spawn_echo_server().await;
        let port = free_port();

        let first = tunnel_start_local(&engine, "db", port, "127.0.0.1", echo_port)
            .await
            .unwrap();
        assert_eq!(first.runtime.status, TunnelStatus::Active);

        let err = tunnel_start_local(&engine, "db", port, "127.0.0.1", echo_port)
            .await
            .unwrap_err();
        let second_id = err.tunnel_id.clone().unwrap();
        let PortConflict {
            requested,
            suggested,
        } = err.error.port_conflict().unwrap();
        assert_eq!(requested, port);

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["tunnelId"], second_id.as_str());
        assert_eq!(json["kind"], "portConflict");
        assert_eq!(json["detail"]["requested"], port);

        let view = tunnel_start_with_port(&engine, &second_id, suggested)
            .await
            .unwrap();
        assert_eq!(view.config.local_port, suggested);
        assert_eq!(view.config.original_port, Some(port));

        tunnel_stop(&engine, &second_id).await.unwrap();
        let reverted = engine.supervisor().get(&second_id).unwrap();
        assert_eq!(reverted.config.local_port, port);
        assert_eq!(reverted.config.original_port, None);

        tunnel_delete(&engine, &first.config.id).await.unwrap();
        tunnel_delete(&engine, &second_id).await.unwrap();
        assert!(tunnel_get_all(&engine).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_remote_and_list_sessions() {
        let (engine, _dir) = engine();
        let view = tunnel_start_remote(&engine, "db", 9000, "127.0.0.1", 3000)
            .await
            .unwrap();
        assert_eq!(view.runtime.status, TunnelStatus::Active);
        assert_eq!(view.runtime.bound_port, Some(9000));

        let sessions = tunnel_list_sessions(&engine);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tunnel_ids, vec![view.config.id.clone()]);

        tunnel_stop(&engine, &view.config.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_tunnel() {
        let (engine, _dir) = engine();
        let err = tunnel_stop(&engine, "missing").await.unwrap_err();
        assert_eq!(err.tunnel_id.as_deref(), Some("missing"));
        assert!(matches!(err.error, TunnelError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_reported() {
        let (engine, _dir) = engine();
        let err = tunnel_start_local(&engine, "nowhere", free_port(), "127.0.0.1", 80)
            .await
            .unwrap_err();
        assert!(matches!(err.error, TunnelError::Connect(_)));

        let views = tunnel_reconcile(&engine).await.unwrap();
        assert_eq!(views.len(), 1);
        assert!(matches!(views[0].runtime.status, TunnelStatus::Error(_)));
    }
}
