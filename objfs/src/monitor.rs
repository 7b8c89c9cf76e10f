//! This module provides a periodic monitor of the TCP connections of the host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const PROC_NET_TCP: &str = "/proc/net/tcp";
pub const PERIOD: Duration = Duration::from_secs(10);

/// `st` value of an established connection.
const TCP_ESTABLISHED: &str = "01";

/// Counts of active and idle TCP connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub active: usize,
    pub idle: usize,
}

impl TcpStats {
    /// Count connections listed in a `/proc/net/tcp` table: established ones are active, any other state is idle.
    pub fn parse(table: &str) -> Self {
        let mut stats = Self::default();

        // skip the header
        for line in table.lines().skip(1) {
            let mut fields = line.split_whitespace();

            // `sl local_address rem_address st ...`
            match fields.nth(3) {
                Some(TCP_ESTABLISHED) => stats.active += 1,
                Some(_) => stats.idle += 1,
                None => {}
            }
        }

        stats
    }
}

/// Log TCP connection counts read from `path` every `period` until `token` is cancelled.
///
/// A table that cannot be read just skips that tick.
pub async fn monitor_tcp(token: CancellationToken, path: &Path, period: Duration) {
    tracing::info!("TCP Monitoring: task is now running...");

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let table = match tokio::fs::read_to_string(path).await {
            Ok(table) => table,
            Err(err) => {
                tracing::error!("TCP Monitoring: Error reading {}: {err}", path.display());
                continue;
            }
        };

        let stats = TcpStats::parse(&table);

        tracing::info!(
            "TCP Monitoring: Active TCP Connections: {}, Idle TCP Connections: {}",
            stats.active,
            stats.idle
        );
    }
}

/// Spawn [`monitor_tcp()`] on `/proc/net/tcp` with the default period.
pub fn start_tcp_monitoring(token: CancellationToken) -> JoinHandle<()> {
    spawn_monitor(token, PathBuf::from(PROC_NET_TCP), PERIOD)
}

fn spawn_monitor(token: CancellationToken, path: PathBuf, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move { monitor_tcp(token, &path, period).await }.in_current_span())
}
