//! The data-path of a filesystem adapter exposing remote bucket objects as files.
//!
//! A generic, robust and efficient crate providing features dedicated to:
//! - prefetching fixed-size blocks of remote objects concurrently,
//! - managing generic asynchronous tasks on a bounded pool of workers,
//! - reaping temporary objects abandoned by crashed or interrupted writes,
//! - monitoring TCP connections in the background.
//!
//! Remote objects are latency-heavy but range-addressable. The read path carves an object into blocks and
//! schedules one [`DownloadTask`](download::DownloadTask) per block on a [`Pool`](task::Pool), which bounds the
//! number of concurrent ranged reads. Each task fills its [`PrefetchBlock`](block::PrefetchBlock) and moves it
//! to a terminal state, waking whoever waits on it:
//!
//! ```text
//!     consumer --claim + submit--> Pool --execute--> DownloadTask --ranged read--> Bucket
//!        ^                                                |
//!        +--------- await_ready() <-- notify_ready() -----+
//! ```
//!
//! Independently, a [`Reaper`](gc::Reaper) runs a list → filter → delete pipeline over the temporary object prefix
//! every 10 minutes, for the whole lifetime of the mount.
//!
//! Everything runs on `tokio`. Cancellation is explicit: download tasks, pipeline stages and background loops
//! all take a [`CancellationToken`](tokio_util::sync::CancellationToken), and a cancelled operation is always told
//! apart from a failed one, both in logs and in metrics.
//!
//! As a **strong hypothesis**, we can assume that:
//! - a block has one logical owner at a time, which decides when to allocate, reuse or evict it;
//! - retrying failed downloads is up to that owner, tasks never retry by themselves.

pub mod block;
pub mod download;
pub mod gc;
pub mod metrics;
pub mod monitor;
pub mod read_handle;
pub mod storage;
pub mod task;
