//! This module provides prefetch blocks, the buffers download tasks fill.
//!
//! A [`PrefetchBlock`] holds one contiguous byte range of a remote object. Its lifecycle is driven by a small
//! state machine:
//!
//! ```text
//!     NotReady --claim()--> Downloading --notify_ready()--> Downloaded
//!                                                      \--> DownloadFailed(err)
//! ```
//!
//! The terminal status is published once through a [`watch`] channel, so the consumer can wait for it and then
//! observe it any number of times. A block is written by at most one download task at a time, the consumer
//! owns it and decides when to [`reuse`](PrefetchBlock::reuse) it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block is already claimed (state: {0:?})")]
    AlreadyClaimed(BlockState),
    #[error("block is not being downloaded (state: {0:?})")]
    NotDownloading(BlockState),
    #[error("block is already in terminal state {0:?}")]
    AlreadyTerminal(BlockState),
    #[error("block is still being downloaded")]
    Busy,
    #[error("block is not downloaded (state: {0:?})")]
    NotDownloaded(BlockState),
    #[error("write of {len} bytes overflows block capacity ({written}/{capacity} bytes written)")]
    Overflow { len: usize, written: usize, capacity: usize },
    #[error("offset {offset} is out of block bounds ({size} bytes)")]
    OutOfBounds { offset: u64, size: u64 },
    #[error("terminal status must be downloaded or failed, got {0:?}")]
    InvalidStatus(BlockState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    NotReady,
    Downloading,
    Downloaded,
    DownloadFailed,
}

impl BlockState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, BlockState::Downloaded | BlockState::DownloadFailed)
    }
}

/// Block state together with the error that caused a failure, if any.
#[derive(Debug, Clone)]
pub struct BlockStatus {
    pub state: BlockState,
    pub err: Option<Arc<crate::download::Error>>,
}

impl BlockStatus {
    #[inline]
    pub fn downloaded() -> Self {
        Self {
            state: BlockState::Downloaded,
            err: None,
        }
    }

    #[inline]
    pub fn failed(err: crate::download::Error) -> Self {
        Self {
            state: BlockState::DownloadFailed,
            err: Some(Arc::new(err)),
        }
    }

    fn not_ready() -> Self {
        Self {
            state: BlockState::NotReady,
            err: None,
        }
    }
}

/// A fixed-capacity buffer for one range of a remote object.
#[derive(Debug)]
pub struct PrefetchBlock {
    abs_start_off: AtomicU64,
    capacity: usize,
    buf: Mutex<BytesMut>,
    status: watch::Sender<BlockStatus>,
}

impl PrefetchBlock {
    /// Create a block covering `[abs_start_off, abs_start_off + capacity)` of an object.
    pub fn new(capacity: usize, abs_start_off: u64) -> Self {
        Self {
            abs_start_off: AtomicU64::new(abs_start_off),
            capacity,
            buf: Mutex::new(BytesMut::with_capacity(capacity)),
            status: watch::Sender::new(BlockStatus::not_ready()),
        }
    }

    #[inline]
    pub fn abs_start_off(&self) -> u64 {
        self.abs_start_off.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cap(&self) -> u64 {
        self.capacity as u64
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn size(&self) -> u64 {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        self.status.borrow().state
    }

    /// Current status, terminal or not.
    #[inline]
    pub fn status(&self) -> BlockStatus {
        self.status.borrow().clone()
    }

    /// Move a fresh block to `Downloading` on behalf of the task about to fill it.
    pub fn claim(&self) -> Result<(), BlockError> {
        let mut current = BlockState::NotReady;

        let claimed = self.status.send_if_modified(|status| {
            current = status.state;
            if status.state == BlockState::NotReady {
                status.state = BlockState::Downloading;
                true
            } else {
                false
            }
        });

        if claimed {
            Ok(())
        } else {
            Err(BlockError::AlreadyClaimed(current))
        }
    }

    /// Append `data` to the block, refusing anything past its capacity.
    pub fn write(&self, data: &[u8]) -> Result<(), BlockError> {
        let state = self.state();
        if state != BlockState::Downloading {
            return Err(BlockError::NotDownloading(state));
        }

        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);

        if buf.len() + data.len() > self.capacity {
            return Err(BlockError::Overflow {
                len: data.len(),
                written: buf.len(),
                capacity: self.capacity,
            });
        }

        buf.extend_from_slice(data);

        Ok(())
    }

    /// Publish the terminal status of the block and wake its waiter.
    ///
    /// Only the first terminal status is kept, later ones are rejected. A block is expected to be
    /// [claimed](Self::claim) first; an unclaimed block can still be failed, which is how a download task
    /// handed a block it cannot fill releases its waiter, but never marked downloaded.
    pub fn notify_ready(&self, status: BlockStatus) -> Result<(), BlockError> {
        let next = status.state;
        if !next.is_terminal() {
            return Err(BlockError::InvalidStatus(next));
        }

        let mut res = Ok(());
        let mut status = Some(status);

        self.status.send_if_modified(|s| {
            res = match s.state {
                current if current.is_terminal() => Err(BlockError::AlreadyTerminal(current)),
                BlockState::NotReady if next == BlockState::Downloaded => Err(BlockError::NotDownloading(BlockState::NotReady)),
                _ => Ok(()),
            };

            match (&res, status.take()) {
                (Ok(()), Some(status)) => {
                    *s = status;
                    true
                }
                _ => false,
            }
        });

        res
    }

    /// Wait until the block reaches a terminal state and return that status.
    pub async fn await_ready(&self) -> BlockStatus {
        let mut rx = self.status.subscribe();

        // the sender lives as long as `self`, so waiting cannot fail
        let status = match rx.wait_for(|status| status.state.is_terminal()).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };

        status
    }

    /// Copy downloaded data starting at `off` (relative to the block start) into `dst`.
    ///
    /// Returns the number of bytes copied, which is less than `dst.len()` near the end of the block.
    pub fn read_at(&self, dst: &mut [u8], off: u64) -> Result<usize, BlockError> {
        let state = self.state();
        if state != BlockState::Downloaded {
            return Err(BlockError::NotDownloaded(state));
        }

        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let size = buf.len() as u64;

        if off > size {
            return Err(BlockError::OutOfBounds { offset: off, size });
        }

        let src = &buf[off as usize..];
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);

        Ok(n)
    }

    /// Reset the block so it can hold another range, keeping its allocation.
    ///
    /// A block cannot be reused while a task is filling it.
    pub fn reuse(&self, abs_start_off: u64) -> Result<(), BlockError> {
        let mut busy = false;

        self.status.send_if_modified(|status| {
            busy = status.state == BlockState::Downloading;
            if !busy {
                *status = BlockStatus::not_ready();
            }
            !busy
        });

        if busy {
            return Err(BlockError::Busy);
        }

        self.buf.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.abs_start_off.store(abs_start_off, Ordering::Release);

        Ok(())
    }
}
