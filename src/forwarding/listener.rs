//! Running forward listener handle
//!
//! A listener is one background task (accept loop for local forwards,
//! forwarded-channel loop for remote forwards) plus a `JoinSet` of relay
//! tasks it owns. Stopping cancels the token; the task tears its relays down
//! and exits. The owner observes why a listener ended through a watch channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::relay::{ForwardStats, ForwardStatsAtomic};

/// Lifecycle of a listener task as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting and relaying
    Active,
    /// Stopped on request
    Stopped,
    /// The SSH session went away underneath the listener
    SessionLost,
    /// Listener died on its own (socket error, dispatcher gone)
    Failed(String),
}

impl ListenerState {
    pub fn is_active(&self) -> bool {
        matches!(self, ListenerState::Active)
    }
}

pub struct ListenerHandle {
    /// `bind -> target`, for logs
    description: String,
    /// Port actually listened on (client side for local, server side for remote)
    bound_port: u16,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<ListenerState>,
    stats: Arc<ForwardStatsAtomic>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("description", &self.description)
            .field("bound_port", &self.bound_port)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl ListenerHandle {
    pub(crate) fn new(
        description: String,
        bound_port: u16,
        cancel: CancellationToken,
        task: JoinHandle<()>,
        state_rx: watch::Receiver<ListenerState>,
        stats: Arc<ForwardStatsAtomic>,
    ) -> Self {
        Self {
            description,
            bound_port,
            cancel,
            task: Mutex::new(Some(task)),
            state_rx,
            stats,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn state(&self) -> ListenerState {
        self.state_rx.borrow().clone()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.to_stats()
    }

    /// Resolve once the listener leaves `Active`, with the reason.
    pub async fn closed(&self) -> ListenerState {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(|state| !state.is_active()).await {
            Ok(state) => state.clone(),
            Err(_) => ListenerState::Failed("listener task ended unexpectedly".to_string()),
        };
        state
    }

    /// Cancel the accept loop and every in-flight relay.
    ///
    /// Waits at most `timeout` for the task to finish its teardown, then
    /// aborts it. Calling `stop` twice is harmless.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return;
        };

        info!("Stopping forward {}", self.description);
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(
                "Forward {} did not stop within {}ms, aborting",
                self.description,
                timeout.as_millis()
            );
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
