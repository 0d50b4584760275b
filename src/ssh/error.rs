//! SSH Error types

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The server refused a `tcpip-forward` global request.
    #[error("Remote forward rejected: {0}")]
    ForwardRejected(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Failure to establish a pooled session.
///
/// `Clone` because a single connect attempt is shared by every concurrent
/// `acquire` for the same connection id, and each waiter gets its own copy.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConnectError {
    #[error("Authentication failed for {host} ({connection_id}): {reason}")]
    #[serde(rename_all = "camelCase")]
    AuthFailed {
        connection_id: String,
        host: String,
        reason: String,
    },

    /// The server's host key is unknown (strict mode) or has changed
    #[error("Host key for {host} ({connection_id}) rejected: {reason}")]
    #[serde(rename_all = "camelCase")]
    HostKeyRejected {
        connection_id: String,
        host: String,
        reason: String,
    },

    #[error("Host {host} ({connection_id}) unreachable: {reason}")]
    #[serde(rename_all = "camelCase")]
    Unreachable {
        connection_id: String,
        host: String,
        reason: String,
    },

    /// A bastion in the jump chain failed. `hop` 1 is the bastion nearest the target.
    #[error("Jump host {host} ({connection_id}, hop {hop}) failed: {reason}")]
    #[serde(rename_all = "camelCase")]
    JumpHostFailed {
        hop: usize,
        connection_id: String,
        host: String,
        reason: String,
    },

    #[error("Jump chain starting at {connection_id} exceeds {max_hops} hops (cycle?)")]
    #[serde(rename_all = "camelCase")]
    JumpChainTooLong {
        connection_id: String,
        max_hops: usize,
    },

    #[error("Unknown connection: {connection_id}")]
    #[serde(rename_all = "camelCase")]
    UnknownConnection { connection_id: String },

    #[error("Session pool is shutting down")]
    PoolClosed,
}

impl ConnectError {
    /// Classify a transport error raised while connecting to `host`.
    pub fn from_ssh(connection_id: &str, host: &str, err: &SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => ConnectError::AuthFailed {
                connection_id: connection_id.to_string(),
                host: host.to_string(),
                reason: err.to_string(),
            },
            SshError::HostKeyRejected(reason) => ConnectError::HostKeyRejected {
                connection_id: connection_id.to_string(),
                host: host.to_string(),
                reason: reason.clone(),
            },
            _ => ConnectError::Unreachable {
                connection_id: connection_id.to_string(),
                host: host.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Re-attribute a failure that happened while acquiring this connection's
    /// jump host. Hop numbers are relative to the connection being acquired,
    /// so a failure further down the chain moves one hop further out.
    pub fn through_jump(self) -> Self {
        match self {
            ConnectError::AuthFailed {
                connection_id,
                host,
                reason,
            }
            | ConnectError::HostKeyRejected {
                connection_id,
                host,
                reason,
            }
            | ConnectError::Unreachable {
                connection_id,
                host,
                reason,
            } => ConnectError::JumpHostFailed {
                hop: 1,
                connection_id,
                host,
                reason,
            },
            ConnectError::JumpHostFailed {
                hop,
                connection_id,
                host,
                reason,
            } => ConnectError::JumpHostFailed {
                hop: hop + 1,
                connection_id,
                host,
                reason,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_and_network() {
        let auth = ConnectError::from_ssh(
            "c1",
            "db.internal",
            &SshError::AuthenticationFailed("rejected".into()),
        );
        assert!(matches!(auth, ConnectError::AuthFailed { .. }));

        let net = ConnectError::from_ssh("c1", "db.internal", &SshError::Timeout("30s".into()));
        assert!(matches!(net, ConnectError::Unreachable { .. }));
    }

    #[test]
    fn test_changed_host_key_is_not_a_network_failure() {
        let err = ConnectError::from_ssh(
            "c1",
            "db.internal",
            &SshError::HostKeyRejected("key for db.internal:22 has changed".into()),
        );
        match &err {
            ConnectError::HostKeyRejected { host, reason, .. } => {
                assert_eq!(host, "db.internal");
                assert!(reason.contains("has changed"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "hostKeyRejected");

        // Seen from a tunnel behind this host, it is a jump-hop failure
        assert!(matches!(
            err.through_jump(),
            ConnectError::JumpHostFailed { hop: 1, .. }
        ));
    }

    #[test]
    fn test_hop_attribution_counts_outward() {
        // bastion-2 is the jump host of bastion-1, which is the jump host of the target.
        let at_bastion_1 = ConnectError::Unreachable {
            connection_id: "bastion-2".into(),
            host: "10.0.0.2".into(),
            reason: "refused".into(),
        }
        .through_jump();
        let at_target = at_bastion_1.through_jump();
        match at_target {
            ConnectError::JumpHostFailed {
                hop,
                host,
                connection_id,
                ..
            } => {
                assert_eq!(hop, 2);
                assert_eq!(host, "10.0.0.2");
                assert_eq!(connection_id, "bastion-2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chain_errors_pass_through() {
        let err = ConnectError::JumpChainTooLong {
            connection_id: "a".into(),
            max_hops: 8,
        };
        assert_eq!(err.clone().through_jump(), err);
    }

    #[test]
    fn test_connect_error_serialization() {
        let err = ConnectError::JumpHostFailed {
            hop: 1,
            connection_id: "b".into(),
            host: "bastion".into(),
            reason: "auth".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"jumpHostFailed\""));
        assert!(json.contains("\"connectionId\":\"b\""));
    }
}
