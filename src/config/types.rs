//! Engine configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Tunable knobs of the tunnel engine
///
/// Every field has a default so partial or older files still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub version: u32,

    /// Delay before an unreferenced SSH session is disconnected
    pub idle_grace_ms: u64,

    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Missed keepalives before the transport is declared dead
    pub keepalive_max: usize,

    /// Bound on bastion chain length
    pub max_jump_hops: usize,

    /// How many candidate ports a conflict suggestion may try
    pub probe_attempts: u16,

    /// Upper bound on stopping a listener (accept loop and relays)
    pub stop_timeout_ms: u64,
    /// Per-connection relay idle timeout
    pub relay_idle_timeout_secs: u64,

    /// Pause between sequential auto-starts
    pub autostart_stagger_ms: u64,

    /// Reject unknown host keys instead of learning them
    pub strict_host_key_checking: bool,

    /// Status event broadcast buffer
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            idle_grace_ms: 1000,
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
            max_jump_hops: 8,
            probe_attempts: 100,
            stop_timeout_ms: 2000,
            relay_idle_timeout_secs: 300,
            autostart_stagger_ms: 250,
            strict_host_key_checking: false,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_idle_timeout_secs)
    }

    pub fn autostart_stagger(&self) -> Duration {
        Duration::from_millis(self.autostart_stagger_ms)
    }
}
