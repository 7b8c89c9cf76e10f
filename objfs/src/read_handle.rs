//! This module provides the read handle cache shared by the download tasks of one object.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;

/// The latest read handle a bucket issued for an object, if any.
///
/// Clones share the same slot: a reader keeps one cache per object, hands the current handle to each
/// [`DownloadTask`](crate::download::DownloadTask) it schedules and lets successful tasks store the handle
/// the bucket returned through [`ReadHandleCache::updater()`].
#[derive(Debug, Clone, Default)]
pub struct ReadHandleCache {
    handle: Arc<RwLock<Option<Bytes>>>,
}

impl ReadHandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> Option<Bytes> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Store a new handle; empty handles are ignored.
    pub fn set(&self, handle: Bytes) {
        if handle.is_empty() {
            return;
        }

        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Forget the handle, e.g. once the object has been clobbered.
    pub fn clear(&self) {
        self.handle.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// A callback storing whatever handle it is given in this cache.
    pub fn updater(&self) -> impl FnOnce(Bytes) + Send + Sync + 'static {
        let cache = self.clone();
        move |handle| cache.set(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_handle_cache() {
        let cache = ReadHandleCache::new();
        assert_eq!(cache.get(), None);

        let update = cache.updater();
        update(Bytes::from_static(b"handle-1"));
        assert_eq!(cache.get().as_deref(), Some(&b"handle-1"[..]));

        cache.set(Bytes::new());
        assert_eq!(cache.get().as_deref(), Some(&b"handle-1"[..]));

        let clone = cache.clone();
        clone.set(Bytes::from_static(b"handle-2"));
        assert_eq!(cache.get().as_deref(), Some(&b"handle-2"[..]));

        cache.clear();
        assert_eq!(clone.get(), None);
    }
}
