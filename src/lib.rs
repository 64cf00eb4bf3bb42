#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
pub use storage::{BlobMeta, KbFile, Storage};

use storage::LruStore;

/// The operations surface the core offers to collaborators. An HTTP layer,
/// a digest-auth module, or dump/list CLI tools can all be built on top of
/// just this; none of those are part of this crate.
pub struct KbStore {
    inner: LruStore<Storage>,
}

impl KbStore {
    /// Opens (or creates) a store rooted at `config.root`, fronted by an
    /// LRU cache of `config.cache_capacity` blobs.
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Storage::open_with_max_file_size(&config.root, config.max_file_size())?;
        Ok(KbStore {
            inner: LruStore::new(storage, config.cache_capacity),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.get(key)
    }

    /// Stores `blob` under `key`, or a freshly generated key if `key` is
    /// `None`. Returns the key it was stored under.
    pub fn put(&self, key: Option<Vec<u8>>, blob: &[u8]) -> Result<Vec<u8>> {
        self.inner.add_blob(key, blob)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.keys()
    }

    pub fn meta(&self, key: &[u8]) -> Result<BlobMeta> {
        self.inner.meta(key)
    }

    /// Same ordering and skip-on-miss semantics as the cache's `blobs`:
    /// cached hits first (input order), then misses (input order), with
    /// not-found keys silently dropped.
    pub fn bulk_get(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.blobs(keys)
    }

    pub fn reload(&self) -> Result<()> {
        self.inner.reload()
    }
}
