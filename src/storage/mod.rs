//! The key-to-blob storage core: binary codec, single-container engine,
//! multi-file manager, and the LRU cache fronting it.

pub mod codec;
pub mod kbfile;
pub mod lru;
pub mod manager;

pub use kbfile::{BlobMeta, KbFile};
pub use lru::{DataSource, LruStore, DEFAULT_CAPACITY};
pub use manager::Storage;
