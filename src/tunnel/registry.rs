//! Tunnel persistence using redb
//!
//! Database: tunnels.redb
//! Tables:
//!   - tunnels: tunnel id -> TunnelConfig (MessagePack)
//!   - tunnel_metadata: key -> MessagePack (schema version)
//!
//! Runtime status is kept in memory next to the database and merged on read,
//! so a config edit never has to touch it and a restart always starts from
//! Stopped.

#![allow(clippy::result_large_err)]

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, error, info, warn};

use super::error::RegistryError;
use super::types::{TunnelConfig, TunnelRuntimeState, TunnelView};

/// Database version for migrations
pub const TUNNEL_DB_VERSION: u32 = 1;

const TUNNELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnels");

const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnel_metadata");

pub struct TunnelRegistry {
    db: Arc<Database>,
    runtime: DashMap<String, TunnelRuntimeState>,
}

impl TunnelRegistry {
    /// Open (or create) the registry database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create tunnel database directory: {}", e);
            }
        }

        let db = match Database::create(path) {
            Ok(db) => {
                info!("Tunnel database opened at {:?}", path);
                db
            }
            Err(e) => {
                warn!("Failed to open tunnel database: {:?}, attempting recovery", e);

                let backup_path = path.with_extension("redb.backup");
                if let Err(e) = std::fs::rename(path, &backup_path) {
                    error!("Failed to backup corrupted tunnel database: {:?}", e);
                } else {
                    info!("Backed up corrupted tunnel database to {:?}", backup_path);
                }

                Database::create(path)?
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
                warn!("Failed to set tunnel database permissions: {}", e);
            }
        }

        let registry = Self {
            db: Arc::new(db),
            runtime: DashMap::new(),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn initialize(&self) -> Result<(), RegistryError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(TUNNELS_TABLE)?;
            let mut meta = write_txn.open_table(METADATA_TABLE)?;

            let existing_version = meta
                .get("version")?
                .and_then(|v| rmp_serde::from_slice::<u32>(v.value()).ok());

            match existing_version {
                Some(version) if version < TUNNEL_DB_VERSION => {
                    info!(
                        "Migrating tunnel database from v{} to v{}",
                        version, TUNNEL_DB_VERSION
                    );
                    let version_bytes = rmp_serde::to_vec(&TUNNEL_DB_VERSION)?;
                    meta.insert("version", version_bytes.as_slice())?;
                }
                None => {
                    let version_bytes = rmp_serde::to_vec(&TUNNEL_DB_VERSION)?;
                    meta.insert("version", version_bytes.as_slice())?;
                }
                _ => {}
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Insert or replace by id
    pub fn save(&self, config: &TunnelConfig) -> Result<(), RegistryError> {
        config.validate().map_err(RegistryError::Invalid)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            let bytes = rmp_serde::to_vec_named(config)?;
            table.insert(config.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!("Saved tunnel config: {} ({})", config.id, config.name);
        Ok(())
    }

    /// Remove a config and its runtime state. Returns the removed config.
    pub fn delete(&self, id: &str) -> Result<TunnelConfig, RegistryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            let removed = table.remove(id)?;
            match removed {
                Some(bytes) => rmp_serde::from_slice::<TunnelConfig>(bytes.value())?,
                None => return Err(RegistryError::NotFound(id.to_string())),
            }
        };
        write_txn.commit()?;

        self.runtime.remove(id);
        info!("Deleted tunnel config: {}", id);
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<TunnelConfig, RegistryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;
        let bytes = table
            .get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(rmp_serde::from_slice(bytes.value())?)
    }

    pub fn contains(&self, id: &str) -> Result<bool, RegistryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;
        Ok(table.get(id)?.is_some())
    }

    /// All persisted configs, sorted by name then id
    pub fn configs(&self) -> Result<Vec<TunnelConfig>, RegistryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;

        let mut configs = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            match rmp_serde::from_slice::<TunnelConfig>(value.value()) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("Skipping unreadable tunnel record: {}", e),
            }
        }

        configs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(configs)
    }

    pub fn list_all(&self) -> Result<Vec<TunnelView>, RegistryError> {
        Ok(self.configs()?.into_iter().map(|c| self.view(c)).collect())
    }

    pub fn list_by_connection(&self, connection_id: &str) -> Result<Vec<TunnelView>, RegistryError> {
        Ok(self
            .configs()?
            .into_iter()
            .filter(|c| c.connection_id == connection_id)
            .map(|c| self.view(c))
            .collect())
    }

    pub fn list_by_group(&self, group: &str) -> Result<Vec<TunnelView>, RegistryError> {
        Ok(self
            .configs()?
            .into_iter()
            .filter(|c| c.group.as_deref() == Some(group))
            .map(|c| self.view(c))
            .collect())
    }

    /// Config merged with its runtime state
    pub fn get_view(&self, id: &str) -> Result<TunnelView, RegistryError> {
        Ok(self.view(self.get(id)?))
    }

    fn view(&self, config: TunnelConfig) -> TunnelView {
        let runtime = self.runtime_state(&config.id);
        TunnelView { config, runtime }
    }

    pub fn runtime_state(&self, id: &str) -> TunnelRuntimeState {
        self.runtime
            .get(id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn set_runtime(&self, id: &str, state: TunnelRuntimeState) {
        self.runtime.insert(id.to_string(), state);
    }

    /// Forget runtime state, which reads back as Stopped
    pub fn clear_runtime(&self, id: &str) {
        self.runtime.remove(id);
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("runtime_entries", &self.runtime.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::types::TunnelStatus;
    use tempfile::tempdir;

    fn create_test_registry() -> (TunnelRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let registry = TunnelRegistry::open(dir.path().join("tunnels.redb")).unwrap();
        (registry, dir)
    }

    #[test]
    fn test_tunnel_crud() {
        let (registry, _dir) = create_test_registry();

        let mut config = TunnelConfig::local("conn-1", 8080, "127.0.0.1", 80).with_name("web");
        registry.save(&config).unwrap();
        assert_eq!(registry.get(&config.id).unwrap(), config);

        // Upsert by id
        config.local_port = 9090;
        registry.save(&config).unwrap();
        let all = registry.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].config.local_port, 9090);

        let removed = registry.delete(&config.id).unwrap();
        assert_eq!(removed.id, config.id);
        assert!(registry.list_all().unwrap().is_empty());
        assert!(matches!(
            registry.delete(&config.id),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let (registry, _dir) = create_test_registry();
        let config = TunnelConfig::local("conn-1", 0, "127.0.0.1", 80);
        assert!(matches!(
            registry.save(&config),
            Err(RegistryError::Invalid(_))
        ));
    }

    #[test]
    fn test_grouping_and_connection_lookup() {
        let (registry, _dir) = create_test_registry();

        let a = TunnelConfig::local("conn-1", 8080, "127.0.0.1", 80).with_group("dev");
        let b = TunnelConfig::remote("conn-1", 9000, "localhost", 3000);
        let c = TunnelConfig::local("conn-2", 5432, "db", 5432).with_group("dev");
        for config in [&a, &b, &c] {
            registry.save(config).unwrap();
        }

        assert_eq!(registry.list_by_connection("conn-1").unwrap().len(), 2);
        assert_eq!(registry.list_by_connection("conn-3").unwrap().len(), 0);

        let dev: Vec<String> = registry
            .list_by_group("dev")
            .unwrap()
            .into_iter()
            .map(|v| v.config.id)
            .collect();
        assert_eq!(dev.len(), 2);
        assert!(dev.contains(&a.id));
        assert!(dev.contains(&c.id));
    }

    #[test]
    fn test_runtime_state_is_merged_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunnels.redb");
        let config = TunnelConfig::local("conn-1", 8080, "127.0.0.1", 80);

        {
            let registry = TunnelRegistry::open(&path).unwrap();
            registry.save(&config).unwrap();
            registry.set_runtime(
                &config.id,
                TunnelRuntimeState {
                    status: TunnelStatus::Active,
                    bound_port: Some(8080),
                    stats: None,
                },
            );
            assert_eq!(
                registry.get_view(&config.id).unwrap().runtime.status,
                TunnelStatus::Active
            );

            // Editing the config leaves runtime state alone
            let mut edited = config.clone();
            edited.name = "renamed".into();
            registry.save(&edited).unwrap();
            assert_eq!(
                registry.get_view(&config.id).unwrap().runtime.status,
                TunnelStatus::Active
            );
        }

        let reopened = TunnelRegistry::open(&path).unwrap();
        let view = reopened.get_view(&config.id).unwrap();
        assert_eq!(view.config.name, "renamed");
        assert_eq!(view.runtime.status, TunnelStatus::Stopped);
    }

    #[test]
    fn test_remapped_config_without_group_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunnels.redb");
        let mut config = TunnelConfig::local("conn-1", 8080, "127.0.0.1", 80);
        config.remap(8081);
        assert!(config.group.is_none());

        {
            let registry = TunnelRegistry::open(&path).unwrap();
            registry.save(&config).unwrap();
            assert_eq!(registry.get(&config.id).unwrap(), config);
        }

        let reopened = TunnelRegistry::open(&path).unwrap();
        let loaded = reopened.get(&config.id).unwrap();
        assert_eq!(loaded.local_port, 8081);
        assert_eq!(loaded.original_port, Some(8080));
        assert_eq!(loaded.group, None);
        assert_eq!(reopened.list_all().unwrap().len(), 1);

        let mut reverted = loaded;
        assert!(reverted.revert_remap());
        reopened.save(&reverted).unwrap();
        let loaded = reopened.get(&config.id).unwrap();
        assert_eq!(loaded.local_port, 8080);
        assert_eq!(loaded.original_port, None);
    }

    #[test]
    fn test_corrupted_database_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunnels.redb");
        std::fs::write(&path, b"definitely not a redb file").unwrap();

        let registry = TunnelRegistry::open(&path).unwrap();
        assert!(registry.list_all().unwrap().is_empty());
        assert!(dir.path().join("tunnels.redb.backup").exists());
    }
}
