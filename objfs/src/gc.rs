//! This module provides the garbage collection of stale temporary objects.
//!
//! Write paths stage their data in temporary objects under a well-known prefix before composing or renaming
//! them into place. A crash or an interrupted write leaves those objects behind, so they are periodically
//! reaped once they have not been updated for long enough.
//!
//! A collection run is a three-stage pipeline whose stages run concurrently and share one cancellation token:
//!
//! ```text
//!     list prefix --(objects)--> filter stale --(names)--> delete
//! ```
//!
//! Stages are connected by bounded channels, so a slow delete stage throttles listing. The first failing stage
//! cancels the others; objects deleted up to that point stay deleted and are reported along with the error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::storage::{self, Bucket, DeleteObjectRequest, MinObject};

/// Age past which a temporary object is considered abandoned.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(30 * 60);
/// Delay between two collection runs.
pub const PERIOD: Duration = Duration::from_secs(10 * 60);

const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ListPrefix: {0}")]
    List(#[source] storage::Error),
    #[error("DeleteObject({name:?}): {source}")]
    Delete {
        name: String,
        #[source]
        source: storage::Error,
    },
    #[error("garbage collection cancelled")]
    Cancelled,
    #[error("garbage collection stage failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::List(err) | Error::Delete { source: err, .. } => err.is_cancelled(),
            Error::Join(err) => err.is_cancelled(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix under which temporary objects are created.
    pub tmp_object_prefix: String,
    pub period: Duration,
    pub staleness_threshold: Duration,
}

impl Config {
    pub fn new(tmp_object_prefix: impl Into<String>) -> Self {
        Self {
            tmp_object_prefix: tmp_object_prefix.into(),
            period: PERIOD,
            staleness_threshold: STALENESS_THRESHOLD,
        }
    }

    #[inline]
    pub fn with_period(self, period: Duration) -> Self {
        Self { period, ..self }
    }

    #[inline]
    pub fn with_staleness_threshold(self, staleness_threshold: Duration) -> Self {
        Self {
            staleness_threshold,
            ..self
        }
    }
}

/// Deletes stale temporary objects from a bucket.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    bucket: Arc<dyn Bucket>,
    config: Config,
}

impl GarbageCollector {
    pub fn new(bucket: Arc<dyn Bucket>, config: Config) -> Self {
        Self { bucket, config }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a single collection.
    ///
    /// Returns the number of objects deleted, together with the first error any stage ran into. Cancelling `token`
    /// stops the run within at most a channel's worth of items.
    pub async fn collect_once(&self, token: &CancellationToken) -> (u64, Result<(), Error>) {
        let token = token.child_token();
        let deleted = Arc::new(AtomicU64::new(0));
        let now = Utc::now();

        let (objects_tx, objects_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (names_tx, names_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut group = JoinSet::new();

        group.spawn(
            cancel_on_error(
                token.clone(),
                list_stage(
                    token.clone(),
                    Arc::clone(&self.bucket),
                    self.config.tmp_object_prefix.clone(),
                    objects_tx,
                ),
            )
            .in_current_span(),
        );
        group.spawn(
            cancel_on_error(
                token.clone(),
                filter_stage(token.clone(), now, self.config.staleness_threshold, objects_rx, names_tx),
            )
            .in_current_span(),
        );
        group.spawn(
            cancel_on_error(
                token.clone(),
                delete_stage(token.clone(), Arc::clone(&self.bucket), names_rx, Arc::clone(&deleted)),
            )
            .in_current_span(),
        );

        let mut first_err = None;

        while let Some(joined) = group.join_next().await {
            if let Err(err) = joined.map_err(Error::from).and_then(|res| res) {
                token.cancel();

                // stages unwinding because of another stage's failure must not mask it
                if first_err.as_ref().map_or(true, |first: &Error| first.is_cancelled() && !err.is_cancelled()) {
                    first_err = Some(err);
                }
            }
        }

        let deleted = deleted.load(Ordering::Acquire);

        match first_err {
            Some(err) => (deleted, Err(err)),
            None => (deleted, Ok(())),
        }
    }

    /// Collect periodically until `token` is cancelled.
    ///
    /// The first run happens one period after the call. A failed run is logged and does not prevent the next ones.
    pub async fn run(&self, token: CancellationToken) {
        let period = self.config.period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            tracing::info!("Starting a garbage collection run.");

            let start_time = Instant::now();
            let (objects_deleted, res) = self.collect_once(&token).await;

            match res {
                Err(err) => tracing::info!(
                    "Garbage collection failed after deleting {objects_deleted} objects in {:?}, with error: {err}",
                    start_time.elapsed()
                ),
                Ok(()) => tracing::info!(
                    "Garbage collection succeeded after deleting {objects_deleted} objects in {:?}.",
                    start_time.elapsed()
                ),
            }
        }
    }

    /// Run [`GarbageCollector::run()`] in the background until the returned handle is stopped or `parent` is
    /// cancelled.
    pub fn start(self, parent: &CancellationToken) -> Reaper {
        let token = parent.child_token();

        tracing::debug!("Starting garbage collection of `{}` every {:?}...", self.config.tmp_object_prefix, self.config.period);

        let handle = tokio::spawn({
            let token = token.clone();
            async move { self.run(token).await }.in_current_span()
        });

        Reaper { token, handle }
    }
}

/// Handle on a background garbage collection loop.
#[derive(Debug)]
pub struct Reaper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reaper {
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop collecting, waiting for an ongoing run to unwind.
    pub async fn stop(self) {
        tracing::debug!("Stopping garbage collection...");

        self.token.cancel();
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                tracing::error!("Garbage collection loop ended abnormally: {err}.");
            }
        }
    }
}

async fn cancel_on_error<F>(token: CancellationToken, stage: F) -> Result<(), Error>
where
    F: std::future::Future<Output = Result<(), Error>>,
{
    let res = stage.await;
    if res.is_err() {
        token.cancel();
    }
    res
}

/// List all objects with the temporary prefix.
async fn list_stage(
    token: CancellationToken,
    bucket: Arc<dyn Bucket>,
    prefix: String,
    objects: mpsc::Sender<MinObject>,
) -> Result<(), Error> {
    storage::list_prefix(&token, bucket.as_ref(), &prefix, &objects)
        .await
        .map_err(Error::List)
}

/// Forward the names of objects that are stale.
async fn filter_stage(
    token: CancellationToken,
    now: DateTime<Utc>,
    threshold: Duration,
    mut objects: mpsc::Receiver<MinObject>,
    stale_names: mpsc::Sender<String>,
) -> Result<(), Error> {
    while let Some(o) = objects.recv().await {
        if !is_stale(now, o.updated, threshold) {
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            res = stale_names.send(o.name) => res.map_err(|_| Error::Cancelled)?,
        }
    }

    Ok(())
}

/// Delete the latest generation of each stale object.
async fn delete_stage(
    token: CancellationToken,
    bucket: Arc<dyn Bucket>,
    mut stale_names: mpsc::Receiver<String>,
    deleted: Arc<AtomicU64>,
) -> Result<(), Error> {
    while let Some(name) = stale_names.recv().await {
        let req = DeleteObjectRequest {
            name: name.clone(),
            generation: 0,
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            res = bucket.delete_object(req) => res.map_err(|source| Error::Delete { name, source })?,
        }

        deleted.fetch_add(1, Ordering::AcqRel);
    }

    Ok(())
}

/// Objects updated in the future are never stale.
fn is_stale(now: DateTime<Utc>, updated: DateTime<Utc>, threshold: Duration) -> bool {
    (now - updated).to_std().is_ok_and(|age| age >= threshold)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::storage::{ListObjectsRequest, Listing, MemoryBucket, ObjectReader, ReadObjectRequest};

    const PREFIX: &str = "tmp/.objfs_tmp/";

    /// Wraps a memory bucket, failing or stalling calls on demand.
    #[derive(Debug, Default)]
    struct FaultyBucket {
        inner: MemoryBucket,
        /// Number of upcoming list calls to fail.
        failing_lists: AtomicUsize,
        failing_delete: Option<String>,
        /// Deletes past this count never complete.
        stall_deletes_after: Option<usize>,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl Bucket for FaultyBucket {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn new_reader_with_read_handle(&self, req: ReadObjectRequest) -> Result<ObjectReader, storage::Error> {
            self.inner.new_reader_with_read_handle(req).await
        }

        async fn delete_object(&self, req: DeleteObjectRequest) -> Result<(), storage::Error> {
            let count = self.deletes.fetch_add(1, Ordering::SeqCst);

            if self.stall_deletes_after.is_some_and(|limit| count >= limit) {
                futures::future::pending::<()>().await;
            }
            if self.failing_delete.as_deref() == Some(req.name.as_str()) {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "forbidden").into());
            }

            self.inner.delete_object(req).await
        }

        async fn list_objects(&self, req: ListObjectsRequest) -> Result<Listing, storage::Error> {
            let fail = self
                .failing_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if fail {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "list timed out").into());
            }

            self.inner.list_objects(req).await
        }
    }

    fn ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes)
    }

    fn populate(bucket: &MemoryBucket, count: usize, minutes_ago: i64) {
        for i in 0..count {
            bucket.create_object_at(format!("{PREFIX}{i:04}"), Bytes::from_static(b"partial"), ago(minutes_ago));
        }
    }

    fn collector(bucket: Arc<FaultyBucket>) -> GarbageCollector {
        GarbageCollector::new(bucket, Config::new(PREFIX))
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        assert!(!is_stale(now, ago(5), STALENESS_THRESHOLD));
        assert!(is_stale(now, ago(31), STALENESS_THRESHOLD));
        assert!(is_stale(now, ago(120), STALENESS_THRESHOLD));
        assert!(!is_stale(now, now + chrono::Duration::minutes(60), STALENESS_THRESHOLD));
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::new(PREFIX);
        assert_eq!(config.period, Duration::from_secs(600));
        assert_eq!(config.staleness_threshold, Duration::from_secs(1_800));

        let config = config.with_period(Duration::from_secs(1)).with_staleness_threshold(Duration::ZERO);
        assert_eq!(config.period, Duration::from_secs(1));
        assert_eq!(config.staleness_threshold, Duration::ZERO);
        assert_eq!(config.tmp_object_prefix, PREFIX);
    }

    #[tokio::test]
    async fn test_collect_deletes_only_stale_objects() {
        let bucket = Arc::new(FaultyBucket::default());
        bucket.inner.create_object_at(format!("{PREFIX}fresh"), Bytes::new(), ago(5));
        bucket.inner.create_object_at(format!("{PREFIX}stale"), Bytes::new(), ago(31));
        bucket.inner.create_object_at(format!("{PREFIX}ancient"), Bytes::new(), ago(120));
        bucket.inner.create_object_at("dir/ancient", Bytes::new(), ago(120));

        let gc = collector(Arc::clone(&bucket));
        let token = CancellationToken::new();

        let (deleted, res) = gc.collect_once(&token).await;
        res.unwrap();
        assert_eq!(deleted, 2);

        let mut names = bucket.inner.object_names();
        names.sort();
        assert_eq!(names, ["dir/ancient".to_owned(), format!("{PREFIX}fresh")]);

        // nothing new to collect the second time
        let (deleted, res) = gc.collect_once(&token).await;
        res.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_collect_listing_larger_than_channels() {
        let bucket = Arc::new(FaultyBucket {
            inner: MemoryBucket::default().with_page_size(7),
            ..Default::default()
        });
        populate(&bucket.inner, 3 * CHANNEL_CAPACITY, 45);

        let (deleted, res) = collector(Arc::clone(&bucket)).collect_once(&CancellationToken::new()).await;

        res.unwrap();
        assert_eq!(deleted, 3 * CHANNEL_CAPACITY as u64);
        assert!(bucket.inner.object_names().is_empty());
    }

    #[tokio::test]
    async fn test_collect_list_failure() {
        let bucket = Arc::new(FaultyBucket {
            failing_lists: AtomicUsize::new(1),
            ..Default::default()
        });
        populate(&bucket.inner, 3, 45);

        let (deleted, res) = collector(Arc::clone(&bucket)).collect_once(&CancellationToken::new()).await;

        let err = res.unwrap_err();
        assert!(matches!(err, Error::List(_)), "unexpected error: {err}");
        assert!(!err.is_cancelled());
        assert_eq!(deleted, 0);
        assert_eq!(bucket.inner.object_names().len(), 3);
    }

    #[tokio::test]
    async fn test_collect_delete_failure_keeps_partial_progress() {
        let bucket = Arc::new(FaultyBucket {
            failing_delete: Some(format!("{PREFIX}0002")),
            ..Default::default()
        });
        populate(&bucket.inner, 5, 45);

        let (deleted, res) = collector(Arc::clone(&bucket)).collect_once(&CancellationToken::new()).await;

        match res {
            Err(Error::Delete { name, .. }) => assert_eq!(name, format!("{PREFIX}0002")),
            res => panic!("unexpected result: {res:?}"),
        }
        // names are listed in order, so the first two went before the failure
        assert_eq!(deleted, 2);
        assert!(!bucket.inner.contains(&format!("{PREFIX}0000")));
        assert!(bucket.inner.contains(&format!("{PREFIX}0002")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_collect_cancelled_mid_run() {
        let bucket = Arc::new(FaultyBucket {
            stall_deletes_after: Some(3),
            ..Default::default()
        });
        populate(&bucket.inner, 3 * CHANNEL_CAPACITY, 45);

        let token = CancellationToken::new();
        let gc = collector(Arc::clone(&bucket));

        let run = tokio::spawn({
            let token = token.clone();
            async move { gc.collect_once(&token).await }
        });

        while bucket.deletes.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        token.cancel();

        let (deleted, res) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancelled run should terminate promptly")
            .unwrap();

        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn test_collect_with_cancelled_token() {
        let bucket = Arc::new(FaultyBucket::default());
        populate(&bucket.inner, 3, 45);

        let token = CancellationToken::new();
        token.cancel();

        let (deleted, res) = collector(Arc::clone(&bucket)).collect_once(&token).await;

        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(deleted, 0);
        assert_eq!(bucket.inner.object_names().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_reaper_runs_periodically() {
        let bucket = Arc::new(FaultyBucket {
            failing_lists: AtomicUsize::new(1),
            ..Default::default()
        });
        populate(&bucket.inner, 3, 45);

        let mount = CancellationToken::new();
        let reaper = collector(Arc::clone(&bucket)).start(&mount);

        tokio::time::sleep(PERIOD - Duration::from_secs(1)).await;
        assert_eq!(bucket.inner.object_names().len(), 3);

        // the first run fails to list
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bucket.inner.object_names().len(), 3);
        assert!(logs_contain("Garbage collection failed after deleting 0 objects"));

        // which does not prevent the next one
        tokio::time::sleep(PERIOD).await;
        assert!(bucket.inner.object_names().is_empty());
        assert!(logs_contain("Garbage collection succeeded after deleting 3 objects"));
        assert!(!reaper.is_finished());

        reaper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_with_parent() {
        let bucket = Arc::new(FaultyBucket::default());

        let mount = CancellationToken::new();
        let reaper = collector(bucket).start(&mount);

        mount.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(reaper.is_finished());
        reaper.stop().await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_reaper_stop_reports_panicked_loop() {
        let reaper = Reaper {
            token: CancellationToken::new(),
            handle: tokio::spawn(async { panic!("collector exploded") }),
        };

        reaper.stop().await;

        assert!(logs_contain("Garbage collection loop ended abnormally"));
    }
}
