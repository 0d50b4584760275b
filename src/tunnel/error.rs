//! Supervisor and registry errors

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

use super::types::PortConflict;
use crate::forwarding::ForwardError;
use crate::ssh::ConnectError;

#[derive(Debug, Error)]
#[allow(clippy::result_large_err)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid tunnel config: {0}")]
    Invalid(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),
}

impl From<rmp_serde::encode::Error> for RegistryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RegistryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

/// Error returned to callers of the supervisor and the command surface.
///
/// Serializes as `{ "kind", "message", "detail"? }` where `detail` carries the
/// structured payload (conflicting ports, failing hop, forward error).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel not found: {id}")]
    NotFound { id: String },

    #[error("Port {} is already in use, port {} is available", .0.requested, .0.suggested)]
    PortConflict(PortConflict),

    #[error("{0}")]
    Connect(ConnectError),

    #[error("{0}")]
    Forward(ForwardError),

    #[error("SSH session lost")]
    SessionLost,

    #[error("Registry error: {message}")]
    Registry { message: String },

    #[error("Invalid tunnel config: {message}")]
    InvalidConfig { message: String },
}

impl TunnelError {
    /// Conflicts are a choice for the caller, everything else is a failure
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TunnelError::PortConflict(_))
    }

    pub fn port_conflict(&self) -> Option<PortConflict> {
        match self {
            TunnelError::PortConflict(conflict) => Some(*conflict),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::NotFound { .. } => "notFound",
            TunnelError::PortConflict(_) => "portConflict",
            TunnelError::Connect(_) => "connect",
            TunnelError::Forward(_) => "forward",
            TunnelError::SessionLost => "sessionLost",
            TunnelError::Registry { .. } => "registry",
            TunnelError::InvalidConfig { .. } => "invalidConfig",
        }
    }
}

impl Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("kind", self.kind())?;
        map.serialize_entry("message", &self.to_string())?;
        match self {
            TunnelError::NotFound { id } => map.serialize_entry("id", id)?,
            TunnelError::PortConflict(conflict) => map.serialize_entry("detail", conflict)?,
            TunnelError::Connect(e) => map.serialize_entry("detail", e)?,
            TunnelError::Forward(e) => map.serialize_entry("detail", e)?,
            _ => {}
        }
        map.end()
    }
}

impl From<ConnectError> for TunnelError {
    fn from(e: ConnectError) -> Self {
        TunnelError::Connect(e)
    }
}

impl From<ForwardError> for TunnelError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::SessionLost => TunnelError::SessionLost,
            other => TunnelError::Forward(other),
        }
    }
}

impl From<RegistryError> for TunnelError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => TunnelError::NotFound { id },
            RegistryError::Invalid(message) => TunnelError::InvalidConfig { message },
            other => TunnelError::Registry {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_recoverable() {
        let err = TunnelError::PortConflict(PortConflict {
            requested: 8080,
            suggested: 8081,
        });
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Port 8080 is already in use, port 8081 is available"
        );

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "portConflict");
        assert_eq!(json["detail"]["requested"], 8080);
        assert_eq!(json["detail"]["suggested"], 8081);
    }

    #[test]
    fn test_connect_error_detail_survives_serialization() {
        let err: TunnelError = ConnectError::JumpHostFailed {
            hop: 1,
            connection_id: "bastion".into(),
            host: "bastion.example.com".into(),
            reason: "timeout".into(),
        }
        .into();
        assert!(!err.is_recoverable());

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "connect");
        assert_eq!(json["detail"]["kind"], "jumpHostFailed");
        assert_eq!(json["detail"]["hop"], 1);
        assert_eq!(json["detail"]["connectionId"], "bastion");
    }

    #[test]
    fn test_registry_not_found_maps_to_not_found() {
        let err: TunnelError = RegistryError::NotFound("t-1".into()).into();
        assert_eq!(err, TunnelError::NotFound { id: "t-1".into() });
    }
}
