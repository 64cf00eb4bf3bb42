//! A thread-safe, read-through LRU cache fronting any "data source" that
//! behaves like `Storage`.
//!
//! The reference models this as duck typing: anything with `get`/`add_blob`/
//! `keys`/`meta`/`reload`/`blobs` can be wrapped. We model the same shape as
//! a trait so the cache stays generic over its backing source.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache as RawLruCache;

use crate::error::{Error, Result};
use crate::storage::kbfile::BlobMeta;

/// Default cache capacity, matching the reference's `KBCachedStorage`
/// default of 1000 entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// The shape an LRU cache can wrap: anything that can serve blobs by key.
pub trait DataSource {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;
    fn add_blob(&self, key: Option<Vec<u8>>, blob: &[u8]) -> Result<Vec<u8>>;
    fn keys(&self) -> Vec<Vec<u8>>;
    fn meta(&self, key: &[u8]) -> Result<BlobMeta>;
    fn reload(&self) -> Result<()>;
}

impl DataSource for crate::storage::manager::Storage {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        crate::storage::manager::Storage::get(self, key)
    }
    fn add_blob(&self, key: Option<Vec<u8>>, blob: &[u8]) -> Result<Vec<u8>> {
        crate::storage::manager::Storage::add_blob(self, key, blob)
    }
    fn keys(&self) -> Vec<Vec<u8>> {
        crate::storage::manager::Storage::keys(self)
    }
    fn meta(&self, key: &[u8]) -> Result<BlobMeta> {
        crate::storage::manager::Storage::meta(self, key)
    }
    fn reload(&self) -> Result<()> {
        crate::storage::manager::Storage::reload(self)
    }
}

/// Wraps a `DataSource` with a bounded, mutually-exclusive LRU cache of
/// recently touched blobs.
pub struct LruStore<S: DataSource> {
    source: S,
    cache: Mutex<RawLruCache<Vec<u8>, Vec<u8>>>,
}

impl<S: DataSource> LruStore<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        LruStore {
            source,
            cache: Mutex::new(RawLruCache::new(capacity)),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns the cached value if present (promoting it to MRU), else
    /// fetches from the source and caches the result.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(blob) = cache.get(key) {
                return Ok(blob.clone());
            }
        }
        let blob = self.source.get(key)?;
        let mut cache = self.cache.lock().unwrap();
        cache.put(key.to_vec(), blob.clone());
        Ok(blob)
    }

    /// Forwards the write to the source, then caches the stored key/blob.
    pub fn add_blob(&self, key: Option<Vec<u8>>, blob: &[u8]) -> Result<Vec<u8>> {
        let stored_key = self.source.add_blob(key, blob)?;
        let mut cache = self.cache.lock().unwrap();
        cache.put(stored_key.clone(), blob.to_vec());
        Ok(stored_key)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.source.keys()
    }

    pub fn meta(&self, key: &[u8]) -> Result<BlobMeta> {
        self.source.meta(key)
    }

    pub fn reload(&self) -> Result<()> {
        self.source.reload()
    }

    /// Yields already-cached hits first, in input order, then fetches
    /// misses in input order, silently skipping keys that are not found.
    /// Every yielded item promotes its key to MRU.
    ///
    /// Holds the cache's mutex for the whole call, classification and
    /// promotion together, so a concurrent `get` or `add_blob` cannot
    /// interleave partway through.
    pub fn blobs(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut cache = self.cache.lock().unwrap();

        let mut out = Vec::with_capacity(keys.len());
        let mut misses = Vec::new();
        for key in keys {
            match cache.get(key) {
                Some(blob) => out.push((key.clone(), blob.clone())),
                None => misses.push(key.clone()),
            }
        }

        for key in misses {
            match self.source.get(&key) {
                Ok(blob) => {
                    cache.put(key.clone(), blob.clone());
                    out.push((key, blob));
                }
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
