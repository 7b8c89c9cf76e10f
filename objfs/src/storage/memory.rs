use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::*;

const DEFAULT_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone)]
struct StoredObject {
    meta: MinObject,
    data: Bytes,
}

/// An in-process [`Bucket`] keeping objects in a sorted map.
///
/// Every write creates a new generation, reads and deletes honour generation preconditions the way a remote
/// store does, and listings are paginated. Reads hand out a synthetic read handle derived from the object
/// name and generation.
#[derive(Debug)]
pub struct MemoryBucket {
    name: String,
    page_size: usize,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    next_generation: AtomicI64,
}

impl Default for MemoryBucket {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page_size: DEFAULT_PAGE_SIZE,
            objects: Default::default(),
            next_generation: AtomicI64::new(1),
        }
    }

    /// Build a bucket returning at most `page_size` objects per listing page.
    #[inline]
    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..self
        }
    }

    /// Create (or overwrite) an object updated right now.
    pub fn create_object(&self, name: impl Into<String>, data: Bytes) -> MinObject {
        self.create_object_at(name, data, Utc::now())
    }

    /// Create (or overwrite) an object with an explicit last-updated timestamp.
    pub fn create_object_at(&self, name: impl Into<String>, data: Bytes, updated: DateTime<Utc>) -> MinObject {
        let meta = MinObject {
            name: name.into(),
            size: data.len() as u64,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            updated,
            content_encoding: None,
        };

        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meta.name.clone(), StoredObject { meta: meta.clone(), data });

        meta
    }

    pub fn stat(&self, name: &str) -> Option<MinObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|o| o.meta.clone())
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    fn read_handle(meta: &MinObject) -> Bytes {
        Bytes::from(format!("{}#{}", meta.name, meta.generation))
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_reader_with_read_handle(&self, req: ReadObjectRequest) -> Result<ObjectReader, Error> {
        let (data, read_handle) = {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);

            let stored = objects
                .get(&req.name)
                .filter(|o| req.generation == 0 || o.meta.generation == req.generation)
                .ok_or_else(|| Error::NotFound { name: req.name.clone() })?;

            let size = stored.data.len() as u64;
            let range = req.range.unwrap_or(ByteRange { start: 0, limit: size });
            let start = range.start.min(size);
            let limit = range.limit.clamp(start, size);

            (stored.data.slice(start as usize..limit as usize), Self::read_handle(&stored.meta))
        };

        Ok(ObjectReader::new(Cursor::new(data)).with_read_handle(Some(read_handle)))
    }

    async fn delete_object(&self, req: DeleteObjectRequest) -> Result<(), Error> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);

        let found = objects
            .get(&req.name)
            .is_some_and(|o| req.generation == 0 || o.meta.generation == req.generation);

        if !found {
            return Err(Error::NotFound { name: req.name });
        }

        objects.remove(&req.name);

        Ok(())
    }

    async fn list_objects(&self, req: ListObjectsRequest) -> Result<Listing, Error> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);

        let lower = match req.continuation_token {
            Some(token) => Bound::Excluded(token),
            None => Bound::Included(req.prefix.clone()),
        };
        let page_size = req.max_results.unwrap_or(self.page_size).max(1);

        let mut matching = objects
            .range::<String, _>((lower, Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(&req.prefix))
            .map(|(_, o)| &o.meta);

        let min_objects: Vec<_> = matching.by_ref().take(page_size).cloned().collect();
        let continuation_token = matching.next().and(min_objects.last()).map(|o| o.name.clone());

        Ok(Listing {
            min_objects,
            continuation_token,
        })
    }
}
