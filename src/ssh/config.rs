//! SSH Connection records
//!
//! Connections are owned by the UI's connection store. The engine only reads
//! them by id, through a [`ConnectionProvider`].

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Identity of a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection id (stable, assigned by the UI)
    pub id: String,

    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection id of the bastion this host is reached through.
    /// Stored as a plain id; cycles are caught by the pool's hop bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_host_id: Option<String>,
}

/// Authentication methods supported
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    PrivateKey {
        /// Path to private key file (`~` is expanded)
        key_path: String,
        /// Optional passphrase for encrypted keys
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

// Secrets stay out of logs.
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(***)"),
            AuthMethod::PrivateKey {
                key_path,
                passphrase,
            } => f
                .debug_struct("PrivateKey")
                .field("key_path", key_path)
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKey {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

fn default_port() -> u16 {
    22
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            jump_host_id: None,
        }
    }

    /// Set custom port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Route this connection through another connection
    pub fn via(mut self, jump_host_id: impl Into<String>) -> Self {
        self.jump_host_id = Some(jump_host_id.into());
        self
    }

    /// `user@host:port`, for logs
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Read-only lookup of connection records by id
pub trait ConnectionProvider: Send + Sync {
    fn get_connection(&self, connection_id: &str) -> Option<Connection>;
}

/// In-memory connection store the UI collaborator keeps up to date
#[derive(Default)]
pub struct ConnectionBook {
    connections: DashMap<String, Connection>,
}

impl ConnectionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a connection record
    pub fn upsert(&self, connection: Connection) {
        self.connections.insert(connection.id.clone(), connection);
    }

    pub fn remove(&self, connection_id: &str) -> Option<Connection> {
        self.connections.remove(connection_id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ConnectionProvider for ConnectionBook {
    fn get_connection(&self, connection_id: &str) -> Option<Connection> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }
}

impl<T: ConnectionProvider + ?Sized> ConnectionProvider for Arc<T> {
    fn get_connection(&self, connection_id: &str) -> Option<Connection> {
        (**self).get_connection(connection_id)
    }
}

/// Expand ~ to home directory for path normalization
/// This ensures paths like ~/... work correctly with russh::keys
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_builder() {
        let conn = Connection::new("prod", "10.0.0.5", "deploy", AuthMethod::password("pw"))
            .port(2222)
            .via("bastion");
        assert_eq!(conn.port, 2222);
        assert_eq!(conn.jump_host_id.as_deref(), Some("bastion"));
        assert_eq!(conn.display_target(), "deploy@10.0.0.5:2222");
    }

    #[test]
    fn test_auth_debug_hides_secret() {
        let auth = AuthMethod::password("hunter2");
        assert!(!format!("{:?}", auth).contains("hunter2"));
        let key = AuthMethod::key("~/.ssh/id_ed25519", Some("pp".into()));
        let dbg = format!("{:?}", key);
        assert!(dbg.contains("id_ed25519"));
        assert!(!dbg.contains("\"pp\""));
    }

    #[test]
    fn test_connection_deserialize_defaults() {
        let json = r#"{"id":"a","host":"h","username":"u","auth":{"type":"password","password":"x"}}"#;
        let conn: Connection = serde_json::from_str(json).unwrap();
        assert_eq!(conn.port, 22);
        assert!(conn.jump_host_id.is_none());
    }

    #[test]
    fn test_book_lookup() {
        let book = ConnectionBook::new();
        book.upsert(Connection::new("a", "h", "u", AuthMethod::password("x")));
        assert!(book.get_connection("a").is_some());
        assert!(book.get_connection("b").is_none());
        book.remove("a");
        assert!(book.is_empty());
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/etc/key"), "/etc/key");
    }
}
