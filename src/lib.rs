//! OxideTunnel - SSH tunnel lifecycle engine
//!
//! Starts, stops and supervises local and remote TCP port forwards
//! multiplexed over pooled SSH sessions, detects port conflicts and reports
//! status changes to subscribers.

pub mod commands;
pub mod config;
pub mod engine;
pub mod forwarding;
pub mod ssh;
pub mod tunnel;

pub use engine::{EngineError, TunnelEngine};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
/// Calling it again is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
