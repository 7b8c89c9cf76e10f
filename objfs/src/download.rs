//! This module provides the task downloading one block of an object.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockError, BlockStatus, PrefetchBlock};
use crate::metrics::{MetricHandle, Status};
use crate::storage::{self, Bucket, ByteRange, MinObject, ObjectReader, ReadObjectRequest};
use crate::task::Task;

const COPY_BUFFER_SIZE: usize = 64 * 1_024;

#[derive(Debug, Error)]
pub enum Error {
    /// The object was deleted or replaced by a new generation since it was looked up.
    #[error("file {object_name:?} was clobbered: {source}")]
    FileClobbered {
        object_name: String,
        #[source]
        source: storage::Error,
    },
    #[error("DownloadTask.execute: while reader-creation: {0}")]
    ReaderCreation(#[source] storage::Error),
    #[error("DownloadTask.execute: while data-copy: {0}")]
    DataCopy(#[source] io::Error),
    #[error("DownloadTask.execute: while data-copy: {0}")]
    Block(#[from] BlockError),
    #[error("download cancelled")]
    Cancelled,
    #[error("download task dropped before completion")]
    Dropped,
}

impl Error {
    #[inline]
    pub fn is_clobbered(&self) -> bool {
        matches!(self, Error::FileClobbered { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::ReaderCreation(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

type ReadHandleUpdater = Box<dyn FnOnce(Bytes) + Send + Sync>;

/// Download one block of an object from a bucket.
///
/// The block must have been [claimed](PrefetchBlock::claim) by the consumer before the task runs. Whatever
/// happens, the task ends by notifying the block of its terminal state exactly once, and runs at most once.
/// A task that gets dropped before completing (aborted, panicked or never scheduled) fails its block with
/// [`Error::Dropped`], or with [`Error::Cancelled`] if its token was cancelled.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use std::sync::Arc;
/// # use bytes::Bytes;
/// # use tokio_util::sync::CancellationToken;
/// use objfs::block::{BlockState, PrefetchBlock};
/// use objfs::download::DownloadTask;
/// use objfs::metrics::NoopMetrics;
/// use objfs::storage::MemoryBucket;
/// use objfs::task::Pool;
///
/// let bucket = Arc::new(MemoryBucket::default());
/// let object = bucket.create_object("foo", Bytes::from(vec![7; 10_000]));
///
/// let block = Arc::new(PrefetchBlock::new(4_096, 8_192));
/// block.claim().unwrap();
///
/// let mut pool = Pool::default();
/// pool.start(2.try_into().unwrap());
///
/// let task = DownloadTask::new(CancellationToken::new(), object, bucket, Arc::clone(&block), Arc::new(NoopMetrics));
/// pool.submit(task).await.unwrap();
///
/// assert_eq!(block.await_ready().await.state, BlockState::Downloaded);
/// assert_eq!(block.size(), 1_808);
/// # pool.close().await;
/// # })
/// ```
pub struct DownloadTask {
    object: MinObject,
    bucket: Arc<dyn Bucket>,
    metric_handle: Arc<dyn MetricHandle>,
    /// The block to which the data will be downloaded.
    block: Arc<PrefetchBlock>,
    /// Cancels the download.
    token: CancellationToken,
    /// Lets some buckets bypass auth and metadata checks.
    read_handle: Option<Bytes>,
    /// Called with the bucket's updated read handle after a successful read.
    read_handle_updater: Option<ReadHandleUpdater>,
    /// Set once the task starts running.
    stime: Option<Instant>,
    notified: bool,
}

impl DownloadTask {
    pub fn new(
        token: CancellationToken,
        object: MinObject,
        bucket: Arc<dyn Bucket>,
        block: Arc<PrefetchBlock>,
        metric_handle: Arc<dyn MetricHandle>,
    ) -> Self {
        Self {
            object,
            bucket,
            metric_handle,
            block,
            token,
            read_handle: None,
            read_handle_updater: None,
            stime: None,
            notified: false,
        }
    }

    #[inline]
    pub fn with_read_handle(mut self, read_handle: Option<Bytes>) -> Self {
        self.read_handle = read_handle;
        self
    }

    #[inline]
    pub fn with_read_handle_updater(mut self, updater: impl FnOnce(Bytes) + Send + Sync + 'static) -> Self {
        self.read_handle_updater = Some(Box::new(updater));
        self
    }

    /// Block index within the object, for logging.
    #[inline]
    fn block_id(&self) -> u64 {
        self.block.abs_start_off() / self.block.cap().max(1)
    }

    /// Byte range of the object this task fetches: `[start, min(start + capacity, size))`.
    fn range(&self) -> ByteRange {
        let start = self.block.abs_start_off();
        let limit = start.saturating_add(self.block.cap()).min(self.object.size);

        ByteRange {
            start,
            limit: limit.max(start),
        }
    }

    /// Download the block, then report the outcome to the block, metrics and logs.
    ///
    /// Only the first call does anything.
    pub async fn run(&mut self) {
        let block_id = self.block_id();
        if self.stime.is_some() {
            tracing::warn!("Download: block ({}, {block_id}) already run.", self.object.name);
            return;
        }
        tracing::trace!("Download: <- block ({}, {block_id}).", self.object.name);

        let stime = *self.stime.insert(Instant::now());

        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            result = self.download() => result,
        };

        let dur = stime.elapsed();

        let (status, block_status) = match result {
            Ok(read_handle) => {
                if let (Some(updater), Some(read_handle)) = (self.read_handle_updater.take(), read_handle) {
                    updater(read_handle);
                }

                tracing::trace!("Download: -> block ({}, {block_id}) Ok({dur:?}).", self.object.name);
                (Status::Successful, BlockStatus::downloaded())
            }
            Err(err) if err.is_cancelled() && self.token.is_cancelled() => {
                tracing::trace!("Download: -> block ({}, {block_id}) cancelled: {err}.", self.object.name);
                (Status::Cancelled, BlockStatus::failed(err))
            }
            Err(err) => {
                tracing::error!("Download: -> block ({}, {block_id}) failed: {err}.", self.object.name);
                (Status::Failed, BlockStatus::failed(err))
            }
        };

        self.notify(block_status);

        self.metric_handle.buffered_read_download_block_latency(dur, status);
        self.metric_handle.buffered_read_scheduled_block_count(1, status);
    }

    /// Fetch the block range into the block, returning the read handle the bucket issued.
    async fn download(&self) -> Result<Option<Bytes>, Error> {
        let range = self.range();

        let req = ReadObjectRequest {
            name: self.object.name.clone(),
            generation: self.object.generation,
            range: Some(range),
            read_compressed: self.object.has_content_encoding_gzip(),
            read_handle: self.read_handle.clone(),
        };

        let mut reader = match self.bucket.new_reader_with_read_handle(req).await {
            Ok(reader) => reader,
            Err(err) if err.is_not_found() => {
                return Err(Error::FileClobbered {
                    object_name: self.object.name.clone(),
                    source: err,
                })
            }
            Err(err) => return Err(Error::ReaderCreation(err)),
        };

        copy_n(&mut reader, &self.block, range.len()).await?;

        Ok(reader.read_handle())
    }

    fn notify(&mut self, status: BlockStatus) {
        self.notified = true;

        if let Err(err) = self.block.notify_ready(status) {
            tracing::warn!("Download: block ({}, {}) not notified: {err}.", self.object.name, self.block_id());
        }
    }
}

/// Copy exactly `n` bytes from `reader` into `block`; a shorter stream is an error.
async fn copy_n(reader: &mut ObjectReader, block: &PrefetchBlock, n: u64) -> Result<(), Error> {
    let mut buf = vec![0; COPY_BUFFER_SIZE.min(n as usize)];
    let mut remaining = n;

    while remaining > 0 {
        let len = buf.len().min(remaining as usize);
        let read = reader.read(&mut buf[..len]).await.map_err(Error::DataCopy)?;

        if read == 0 {
            return Err(Error::DataCopy(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {remaining} bytes short of {n}"),
            )));
        }

        block.write(&buf[..read])?;
        remaining -= read as u64;
    }

    Ok(())
}

impl Task for DownloadTask {
    fn execute(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        async move { self.run().await }.boxed()
    }
}

impl Drop for DownloadTask {
    fn drop(&mut self) {
        // never leave the consumer waiting on a block nobody will fill
        if self.notified || self.block.state().is_terminal() {
            return;
        }

        let block_id = self.block_id();
        let dur = self.stime.map(|stime| stime.elapsed()).unwrap_or_default();

        let (status, err) = if self.token.is_cancelled() {
            tracing::trace!("Download: -> block ({}, {block_id}) dropped after cancellation.", self.object.name);
            (Status::Cancelled, Error::Cancelled)
        } else {
            tracing::error!("Download: -> block ({}, {block_id}) dropped before completion.", self.object.name);
            (Status::Failed, Error::Dropped)
        };

        self.notify(BlockStatus::failed(err));

        self.metric_handle.buffered_read_download_block_latency(dur, status);
        self.metric_handle.buffered_read_scheduled_block_count(1, status);
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("object", &self.object.name)
            .field("generation", &self.object.generation)
            .field("block_id", &self.block_id())
            .field("state", &self.block.state())
            .finish_non_exhaustive()
    }
}
