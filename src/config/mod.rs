//! Configuration Management Module
//!
//! Engine tunables and where the engine keeps its files on disk.

pub mod storage;
pub mod types;

pub use storage::{config_dir, engine_config_file, tunnels_db_file, ConfigStorage, StorageError};
pub use types::{EngineConfig, CONFIG_VERSION};
