//! Tunnel lifecycle: persisted definitions, runtime status, supervision.
//!
//! - [`TunnelRegistry`] stores `TunnelConfig`s (redb) and keeps runtime state
//!   alongside, merged on read
//! - [`TunnelSupervisor`] starts and stops tunnels, resolves port conflicts
//!   and reports status changes through [`TunnelEventEmitter`]

mod error;
pub mod events;
pub mod registry;
pub mod supervisor;
mod types;

pub use error::{RegistryError, TunnelError};
pub use events::{TunnelEvent, TunnelEventEmitter, CONFIG_CHANGE_EVENT, STATUS_CHANGE_EVENT};
pub use registry::TunnelRegistry;
pub use supervisor::{SupervisorSettings, TunnelSupervisor};
pub use types::{
    GroupSummary, PortConflict, TunnelConfig, TunnelDirection, TunnelRuntimeState, TunnelStatus,
    TunnelView,
};
