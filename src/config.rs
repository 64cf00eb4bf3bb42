//! Runtime configuration for a storage instance: the root directory, LRU
//! cache capacity, and the file-size cap containers are rolled over at.
//!
//! Layered the way a `config`-crate-based service typically is: defaults,
//! then an optional config file, then environment variables prefixed
//! `KBSTORAGE_`.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::storage::codec::MAX_FILE_SIZE;
use crate::storage::DEFAULT_CAPACITY;

/// Storage configuration. `max_file_size` is read back through
/// [`Config::max_file_size`], which clamps it to the format's hard cap
/// (`storage::codec::MAX_FILE_SIZE`): callers can only tighten the limit,
/// never loosen it.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub cache_capacity: usize,
    max_file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("./data"),
            cache_capacity: DEFAULT_CAPACITY,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

impl Config {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Config {
            root: root.into(),
            ..Config::default()
        }
    }

    /// Loads configuration from an optional TOML file (`path`), then
    /// environment variables (`KBSTORAGE_ROOT`, `KBSTORAGE_CACHE_CAPACITY`,
    /// `KBSTORAGE_MAX_FILE_SIZE`), falling back to [`Config::default`] for
    /// anything neither source sets.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("root", "./data")
            .map_err(config_err)?
            .set_default("cache_capacity", DEFAULT_CAPACITY as i64)
            .map_err(config_err)?
            .set_default("max_file_size", MAX_FILE_SIZE as i64)
            .map_err(config_err)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("KBSTORAGE"));

        let settings = builder.build().map_err(config_err)?;
        Ok(Config {
            root: PathBuf::from(settings.get_string("root").map_err(config_err)?),
            cache_capacity: settings
                .get_int("cache_capacity")
                .map_err(config_err)?
                .try_into()
                .map_err(|_| Error::InvalidArgument("cache_capacity must be positive".into()))?,
            max_file_size: settings
                .get_int("max_file_size")
                .map_err(config_err)?
                .try_into()
                .map_err(|_| Error::InvalidArgument("max_file_size must be positive".into()))?,
        })
    }

    /// The effective per-container size cap: the smaller of the format's
    /// own hard limit and whatever this config requests.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size.min(MAX_FILE_SIZE)
    }
}

fn config_err(err: config::ConfigError) -> Error {
    Error::InvalidArgument(format!("bad configuration: {err}"))
}
