//! This module provides the metrics sink the data-path reports to.

use std::fmt;
use std::time::Duration;

/// Outcome label attached to download metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Successful,
    Cancelled,
    Failed,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Successful => "successful",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics sink interface.
///
/// Implementations must neither block nor fail the caller.
pub trait MetricHandle: Send + Sync + fmt::Debug {
    /// Record how long a block download took.
    fn buffered_read_download_block_latency(&self, latency: Duration, status: Status);

    /// Count scheduled blocks by outcome.
    fn buffered_read_scheduled_block_count(&self, inc: u64, status: Status);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricHandle for NoopMetrics {
    #[inline]
    fn buffered_read_download_block_latency(&self, _: Duration, _: Status) {}

    #[inline]
    fn buffered_read_scheduled_block_count(&self, _: u64, _: Status) {}
}

/// Forwards to whichever recorder is installed for the [`metrics`] facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricHandle for MetricsRecorder {
    fn buffered_read_download_block_latency(&self, latency: Duration, status: Status) {
        metrics::histogram!("buffered_read_download_block_latency", "status" => status.as_str())
            .record(latency.as_secs_f64());
    }

    fn buffered_read_scheduled_block_count(&self, inc: u64, status: Status) {
        metrics::counter!("buffered_read_scheduled_block_count", "status" => status.as_str()).increment(inc);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every observation for later assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMetrics {
        pub(crate) latencies: Mutex<Vec<(Duration, Status)>>,
        pub(crate) scheduled: Mutex<Vec<(u64, Status)>>,
    }

    impl RecordingMetrics {
        pub(crate) fn statuses(&self) -> Vec<Status> {
            self.scheduled.lock().unwrap().iter().map(|&(_, status)| status).collect()
        }
    }

    impl MetricHandle for RecordingMetrics {
        fn buffered_read_download_block_latency(&self, latency: Duration, status: Status) {
            self.latencies.lock().unwrap().push((latency, status));
        }

        fn buffered_read_scheduled_block_count(&self, inc: u64, status: Status) {
            self.scheduled.lock().unwrap().push((inc, status));
        }
    }
}
