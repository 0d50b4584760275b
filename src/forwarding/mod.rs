//! Port forwarding listeners
//!
//! - `probe`: local port availability and alternative suggestions
//! - `local`: client-side listener relaying over `direct-tcpip` channels
//! - `remote`: server-side listener (`tcpip-forward`) relaying back to the client
//! - `listener`: handle shared by both, with cancellation and exit reason

mod error;
pub mod listener;
pub mod local;
pub mod probe;
pub mod relay;
pub mod remote;

pub use error::ForwardError;
pub use listener::{ListenerHandle, ListenerState};
pub use local::{start_local_forward, LocalForward};
pub use probe::PortProbe;
pub use relay::{ForwardStats, ForwardStatsAtomic};
pub use remote::{
    probe_remote_port, start_remote_forward, IncomingChannel, RemoteForward,
    RemoteForwardRegistry,
};
