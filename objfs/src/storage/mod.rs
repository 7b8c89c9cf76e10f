//! This module provides the remote object store abstraction the data-path is built on.
//!
//! A [`Bucket`] can open ranged readers on objects, delete objects and list them by prefix.
//! Implementations must be safe for concurrent use: many download tasks and pipeline stages
//! share one bucket without any outer lock.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod http;
pub use http::*;

mod memory;
pub use memory::*;

const GZIP_CONTENT_ENCODING: &str = "gzip";

#[derive(Debug, Error)]
pub enum Error {
    /// The object does not exist, or not at the requested generation.
    #[error("object not found: {name}")]
    NotFound { name: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("unexpected HTTP status {status} for {url}")]
    Status { status: reqwest::StatusCode, url: url::Url },
    #[error("invalid object metadata: {0}")]
    InvalidMetadata(String),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// The minimal set of object attributes the data-path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinObject {
    pub name: String,
    pub size: u64,
    /// Version identifier of the object content.
    pub generation: i64,
    pub updated: DateTime<Utc>,
    pub content_encoding: Option<String>,
}

impl MinObject {
    #[inline]
    pub fn has_content_encoding_gzip(&self) -> bool {
        self.content_encoding.as_deref() == Some(GZIP_CONTENT_ENCODING)
    }
}

/// A half-open byte range `[start, limit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub limit: u64,
}

impl ByteRange {
    #[inline]
    pub fn len(&self) -> u64 {
        self.limit.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadObjectRequest {
    pub name: String,
    /// `0` reads the latest generation.
    pub generation: i64,
    /// `None` reads the whole object.
    pub range: Option<ByteRange>,
    /// Ask for the stored (compressed) bytes instead of a decoded stream.
    pub read_compressed: bool,
    /// Opaque token from a previous read of the same object, letting some backends skip
    /// authorization and metadata checks.
    pub read_handle: Option<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteObjectRequest {
    pub name: String,
    /// `0` deletes whatever the latest generation is.
    pub generation: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsRequest {
    pub prefix: String,
    pub continuation_token: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub min_objects: Vec<MinObject>,
    /// Set when more results are available.
    pub continuation_token: Option<String>,
}

/// A streamed object body, together with the read handle the backend issued for it.
pub struct ObjectReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    read_handle: Option<Bytes>,
}

impl ObjectReader {
    pub fn new(inner: impl AsyncRead + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
            read_handle: None,
        }
    }

    #[inline]
    pub fn with_read_handle(self, read_handle: Option<Bytes>) -> Self {
        Self { read_handle, ..self }
    }

    /// The handle to pass along with the next read of the same object, if the backend issued one.
    #[inline]
    pub fn read_handle(&self) -> Option<Bytes> {
        self.read_handle.clone()
    }
}

impl fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader").field("read_handle", &self.read_handle).finish_non_exhaustive()
    }
}

impl AsyncRead for ObjectReader {
    #[inline]
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

/// Remote bucket interface.
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    /// Bucket name, for logging.
    fn name(&self) -> &str;

    /// Open a reader on (a range of) an object.
    ///
    /// Must fail with [`Error::NotFound`] when the object is missing or its generation changed.
    async fn new_reader_with_read_handle(&self, req: ReadObjectRequest) -> Result<ObjectReader, Error>;

    /// Delete an object, or the latest generation of it when `req.generation == 0`.
    async fn delete_object(&self, req: DeleteObjectRequest) -> Result<(), Error>;

    /// List one page of objects under a prefix, in name order.
    async fn list_objects(&self, req: ListObjectsRequest) -> Result<Listing, Error>;
}

/// List every object under `prefix`, page by page, sending each one to `objects`.
///
/// Returns [`Error::Cancelled`] as soon as `token` is cancelled or the receiving side is gone,
/// whether waiting on the bucket or on channel capacity.
pub async fn list_prefix(
    token: &CancellationToken,
    bucket: &dyn Bucket,
    prefix: &str,
    objects: &mpsc::Sender<MinObject>,
) -> Result<(), Error> {
    let mut req = ListObjectsRequest {
        prefix: prefix.to_owned(),
        ..Default::default()
    };

    loop {
        let listing = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            listing = bucket.list_objects(req.clone()) => listing?,
        };

        for o in listing.min_objects {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                res = objects.send(o) => res.map_err(|_| Error::Cancelled)?,
            }
        }

        match listing.continuation_token {
            Some(next) => req.continuation_token = Some(next),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_content_encoding() {
        let mut o = MinObject {
            name: "a".into(),
            size: 1,
            generation: 1,
            updated: Utc::now(),
            content_encoding: None,
        };
        assert!(!o.has_content_encoding_gzip());

        o.content_encoding = Some("gzip".into());
        assert!(o.has_content_encoding_gzip());

        o.content_encoding = Some("br".into());
        assert!(!o.has_content_encoding_gzip());
    }

    #[tokio::test]
    async fn test_list_prefix_walks_every_page() {
        let bucket = MemoryBucket::default().with_page_size(2);
        for name in ["tmp/a", "tmp/b", "tmp/c", "tmp/d", "tmp/e", "other/f"] {
            bucket.create_object(name, Bytes::from_static(b"x"));
        }

        let (tx, mut rx) = mpsc::channel(16);
        list_prefix(&CancellationToken::new(), &bucket, "tmp/", &tx).await.unwrap();
        drop(tx);

        let mut names = vec![];
        while let Some(o) = rx.recv().await {
            names.push(o.name);
        }

        assert_eq!(names, ["tmp/a", "tmp/b", "tmp/c", "tmp/d", "tmp/e"]);
    }

    #[tokio::test]
    async fn test_list_prefix_cancelled_while_blocked_on_channel() {
        let bucket = MemoryBucket::default();
        for name in ["tmp/a", "tmp/b", "tmp/c"] {
            bucket.create_object(name, Bytes::from_static(b"x"));
        }

        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);

        let canceller = {
            let token = token.clone();
            async move {
                tokio::task::yield_now().await;
                token.cancel();
            }
        };

        let (res, ()) = tokio::join!(list_prefix(&token, &bucket, "tmp/", &tx), canceller);

        assert!(res.unwrap_err().is_cancelled());
    }
}
