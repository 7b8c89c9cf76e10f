//! This module provides required task pooling features.

use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, Future, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

pub use future::{AbortHandle, Aborted, RemoteHandle};

/// Default number of tasks queued ahead of the workers before submitters have to wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("task pool is not running")]
    Closed,
    #[error("task pool queue is full")]
    Full,
}

/// A unit of work the pool can run.
///
/// Failures are the task's own business: the pool neither returns nor inspects an outcome, so a task
/// reports through its own side channel (a [`PrefetchBlock`](crate::block::PrefetchBlock) for downloads).
pub trait Task: Send + 'static {
    fn execute(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Plain futures run as tasks.
struct FutureTask<F>(F);

impl<F> Task for FutureTask<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    #[inline]
    fn execute(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.0.boxed()
    }
}

type BoxedTask = Box<dyn Task>;

/// A bounded, generic and widely reusable task pool to deal with asynchronous tasks in the background.
///
/// At most as many tasks as there are workers run at the same time, in no guaranteed order. Tasks wait in a
/// bounded queue: once it is full, [`Pool::submit()`] waits for room, throttling producers.
///
/// # Submit tasks
/// Any [`Task`] implementor can be submitted with [`Pool::submit()`] or [`Pool::try_submit()`].
///
/// # Forget futures
/// Futures can just be pushed and forgotten using [`Pool::forget()`] method (futures must return `()`).
///
/// # Keep control over futures
/// Futures can alternatively be pushed while still keeping both a remote handle on a result on completion
/// and an abortable handle to cancel them using [`Pool::execute()`] method (futures can return any `T: Send`).
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use objfs::task::Pool;
/// let mut pool = Pool::default();
/// pool.start(3.try_into().unwrap());
///
/// for i in 0..=5 {
///     pool.forget(async move { println!("Hello from task #{i}!") }).await.unwrap();
/// }
///
/// pool.close().await;
/// # })
/// ```
/// ```text
/// Hello from task #0!
/// Hello from task #1!
/// Hello from task #2!
/// Hello from task #3!
/// Hello from task #4!
/// Hello from task #5!
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The sending part of a channel to push tasks to the workers.
    ///
    /// The next available worker will wait for a task to be received through the channel.
    sender: Option<mpsc::Sender<BoxedTask>>,
    queue_capacity: usize,
}

impl Default for Pool {
    fn default() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Pool {
    /// Create a stopped pool queueing up to `queue_capacity` pending tasks once started.
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            workers: Vec::new(),
            sender: None,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Start a pool with `size` workers.
    ///
    /// Once started, tasks can be pushed and will be processed in the background.
    ///
    /// # Panics
    /// This method panics if the pool is already running, ie. when called more than once without stopping the pool in between.
    pub fn start(&mut self, size: NonZeroU8) {
        assert!(self.sender.is_none() && self.workers.is_empty());

        let (sender, receiver) = mpsc::channel(self.queue_capacity);

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        self.workers = (0..size).map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver))).collect();
        self.sender = Some(sender);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Number of workers, hence the maximum number of tasks running at once.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task, waiting for room in the queue if needed.
    ///
    /// Fails with [`Error::Closed`] when the pool is not running.
    pub async fn submit(&self, task: impl Task) -> Result<(), Error> {
        let sender = self.sender.as_ref().ok_or(Error::Closed)?;

        sender.send(Box::new(task)).await.map_err(|_| Error::Closed)
    }

    /// Queue a task without waiting.
    ///
    /// Fails with [`Error::Full`] when the queue is full, in which case the task is dropped.
    pub fn try_submit(&self, task: impl Task) -> Result<(), Error> {
        let sender = self.sender.as_ref().ok_or(Error::Closed)?;

        sender.try_send(Box::new(task)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::Full,
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Send a future and keep remote and abort handles on it.
    ///
    /// Futures returning any `T: Send` can be sent while still keeping both a remote handle on a result on completion
    /// and an abortable handle to cancel it.
    ///
    /// To retrieve a result on completion, just await on the remote handle:
    /// ```
    /// # tokio_test::block_on(async {
    /// # use objfs::task::Pool;
    /// # let mut pool = Pool::default();
    /// # pool.start(3.try_into().unwrap());
    /// let (remote_handle, _) = pool.execute(async { "Hello world!" }).await.unwrap();
    ///
    /// if let Ok(msg) = remote_handle.await {
    ///     println!("{msg}");
    /// }
    /// # })
    /// ```
    /// ```text
    /// Hello world!
    /// ```
    ///
    /// **Be aware that if you just drop the remote handle, it will automatically cancel the future.**
    /// Call `remote_handle.forget()` to let it complete in the background instead.
    ///
    /// To cancel a future, just call `abort_handle.abort()` on the abortable handle.
    /// The remote handle part will then return an `Err(Aborted)` on its side:
    /// ```
    /// # tokio_test::block_on(async {
    /// # use objfs::task::{Aborted, Pool};
    /// # let mut pool = Pool::default();
    /// # pool.start(3.try_into().unwrap());
    /// let (remote_handle, abort_handle) = pool.execute(async { "Hello world!" }).await.unwrap();
    ///
    /// abort_handle.abort();
    ///
    /// assert_eq!(remote_handle.await, Err(Aborted));
    /// # })
    /// ```
    pub async fn execute<T: Send + 'static>(
        &self,
        future: impl Future<Output = T> + Send + 'static,
    ) -> Result<(RemoteHandle<Result<T, Aborted>>, AbortHandle), Error> {
        let (abortable, abort_handle) = future::abortable(future);
        let (remote, remote_handle) = abortable.remote_handle();

        self.forget(remote).await?;

        Ok((remote_handle, abort_handle))
    }

    /// Send a future and forget it.
    #[inline]
    pub async fn forget(&self, future: impl Future<Output = ()> + Send + 'static) -> Result<(), Error> {
        self.submit(FutureTask(future)).await
    }

    /// Stop current pool of workers, waiting for all pending tasks to complete.
    ///
    /// New tasks are refused right away, already queued ones still run. Once stopped, the pool can be started
    /// again with any number of workers.
    pub async fn stop(&mut self) {
        drop(self.sender.take());
        let workers = std::mem::take(&mut self.workers);

        future::join_all(workers.into_iter().inspect(|worker| {
            tracing::debug!("Stopping worker {}...", worker.id);
        }))
        .await;
    }

    /// Close current pool of workers, waiting for all pending tasks to complete.
    ///
    /// Once closed, the pool cannot be used since it is consumed.
    pub async fn close(mut self) {
        self.stop().await
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<BoxedTask>>>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    let message = receiver.lock().await.recv().await;

                    match message {
                        Some(task) => {
                            tracing::trace!("Executing task on worker {id}...");

                            // a panicking task must neither kill its worker nor the pool
                            let result = AssertUnwindSafe(async move { task.execute().await }).catch_unwind().await;

                            if result.is_err() {
                                tracing::error!("Task panicked on worker {id}.");
                            }
                        }
                        None => {
                            tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }
            .in_current_span()),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}
