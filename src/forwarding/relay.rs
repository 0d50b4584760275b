//! Bidirectional byte relay between a client socket and an SSH channel

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-direction read buffer
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (local socket -> SSH channel)
    pub bytes_sent: u64,
    /// Total bytes received (SSH channel -> local socket)
    pub bytes_received: u64,
}

/// Lock-free counters updated from relay tasks
#[derive(Debug, Default)]
pub struct ForwardStatsAtomic {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ForwardStatsAtomic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Decrements `active_connections` when a relay task ends, including when
/// the task is aborted mid-transfer.
pub(crate) struct ActiveConnectionGuard<'a>(&'a ForwardStatsAtomic);

impl<'a> ActiveConnectionGuard<'a> {
    pub(crate) fn new(stats: &'a ForwardStatsAtomic) -> Self {
        stats.connection_opened();
        Self(stats)
    }
}

impl Drop for ActiveConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Pipe bytes both ways until both sides have closed.
///
/// EOF on one side is forwarded as a write shutdown on the other, so
/// half-closed protocols keep working. An error or `idle_timeout` without
/// traffic in a direction ends the whole relay.
pub async fn relay<L, C>(
    local: L,
    channel: C,
    stats: &ForwardStatsAtomic,
    idle_timeout: Duration,
) -> io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (channel_read, channel_write) = tokio::io::split(channel);

    tokio::try_join!(
        pump(local_read, channel_write, &stats.bytes_sent, idle_timeout),
        pump(channel_read, local_write, &stats.bytes_received, idle_timeout),
    )?;

    debug!("Relay finished");
    Ok(())
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    idle_timeout: Duration,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("relay idle for {}s", idle_timeout.as_secs()),
                ))
            }
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
