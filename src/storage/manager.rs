//! Directory index and multi-file storage manager: discovers containers on
//! disk, tracks which one owns each key, and routes writes to the current
//! one, rolling over when it fills up.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::storage::codec::MAX_FILE_SIZE;
use crate::storage::kbfile::{BlobMeta, KbFile};

struct Inner {
    root: PathBuf,
    /// Container name -> open engine.
    files: HashMap<String, KbFile>,
    /// Key -> name of the container holding it.
    key_map: HashMap<Vec<u8>, String>,
    /// Container new writes are routed to.
    current_file: Option<String>,
    /// Cap applied to every container this manager creates.
    max_file_size: u64,
}

impl Inner {
    fn load(root: &Path, max_file_size: u64) -> Result<Self> {
        fs::create_dir_all(root)?;
        let mut files = HashMap::new();
        let mut key_map = HashMap::new();
        let mut current_file: Option<String> = None;
        let mut current_size: Option<u64> = None;

        for path in discover_containers(root)? {
            let mut kbf = KbFile::open(&path)?;
            kbf.set_max_file_size(max_file_size);
            let name = kbf.name().to_string();
            for key in kbf.keys() {
                key_map.insert(key.clone(), name.clone());
            }
            let size = kbf.size();
            let is_smallest = match current_size {
                None => true,
                Some(smallest) => size < smallest,
            };
            if is_smallest {
                current_file = Some(name.clone());
                current_size = Some(size);
            }
            files.insert(name, kbf);
        }

        let mut inner = Inner {
            root: root.to_path_buf(),
            files,
            key_map,
            current_file,
            max_file_size,
        };
        if inner.current_file.is_none() {
            let name = inner.new_file()?;
            inner.current_file = Some(name);
        }
        Ok(inner)
    }

    /// `<root>/<name[-1]>/<name[-2]>/<name>.kbf`.
    fn path_for(root: &Path, name: &str) -> PathBuf {
        let bytes = name.as_bytes();
        let last = bytes[bytes.len() - 1] as char;
        let second_last = bytes[bytes.len() - 2] as char;
        root.join(last.to_string())
            .join(second_last.to_string())
            .join(format!("{name}.kbf"))
    }

    fn new_file(&mut self) -> Result<String> {
        let mut name = random_container_name();
        while self.files.contains_key(&name) {
            name = random_container_name();
        }
        let path = Self::path_for(&self.root, &name);
        log::info!("creating new container {name} at {}", path.display());
        let kbf = KbFile::create_with_limit(&path, Some(name.clone()), self.max_file_size)?;
        self.files.insert(name.clone(), kbf);
        Ok(name)
    }
}

fn random_container_name() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

fn discover_containers(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for level1 in read_subdirs(root)? {
        for level2 in read_subdirs(&level1)? {
            for entry in fs::read_dir(&level2)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("kbf") {
                    out.push(path);
                }
            }
        }
    }
    Ok(out)
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

/// Multi-file storage manager: the directory index plus the write router.
///
/// All externally callable operations execute under a single process-wide
/// mutex held for the operation's duration, matching the reference's
/// `@synchronized`-on-every-method discipline.
pub struct Storage {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl Storage {
    /// Scans `root` for existing containers and opens a storage manager
    /// rooted there. Creates `root` if it doesn't exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_max_file_size(root, MAX_FILE_SIZE)
    }

    /// Like [`Storage::open`], but caps every container this manager
    /// creates at `max_file_size` instead of the format's full
    /// `MAX_FILE_SIZE`, so a caller can force rollover across several
    /// containers without allocating a real 1 GiB file.
    pub fn open_with_max_file_size(root: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        let root = root.into();
        let inner = Inner::load(&root, max_file_size)?;
        Ok(Storage { root, inner: Mutex::new(inner) })
    }

    /// Discards all in-memory state and re-scans `root` from disk.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let max_file_size = inner.max_file_size;
        *inner = Inner::load(&self.root, max_file_size)?;
        Ok(())
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.key_map.keys().cloned().collect()
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let name = inner
            .key_map
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key_repr(key)))?;
        let kbf = inner
            .files
            .get_mut(&name)
            .expect("key_map entry without a backing container");
        kbf.get(key)
    }

    pub fn meta(&self, key: &[u8]) -> Result<BlobMeta> {
        let inner = self.inner.lock().unwrap();
        let name = inner
            .key_map
            .get(key)
            .ok_or_else(|| Error::NotFound(key_repr(key)))?;
        let kbf = inner
            .files
            .get(name)
            .expect("key_map entry without a backing container");
        kbf.meta(key)
    }

    /// Stores `blob` under `key` (or a generated key), creating a fresh
    /// container and retrying once if the current one is full. A global
    /// re-put of an existing key deletes the prior copy first, so a key
    /// never ends up indexed under two containers at once.
    pub fn add_blob(&self, key: Option<Vec<u8>>, blob: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(k) = &key {
            if let Some(owner) = inner.key_map.get(k).cloned() {
                if let Some(f) = inner.files.get_mut(&owner) {
                    f.delete(k).ok();
                }
                inner.key_map.remove(k);
            }
        }

        let current_name = inner
            .current_file
            .clone()
            .expect("current_file is always populated after load");

        let stored_key = {
            let kbf = inner
                .files
                .get_mut(&current_name)
                .expect("current_file always names a live container");
            match kbf.add_blob(key.clone(), blob) {
                Ok(stored_key) => stored_key,
                Err(Error::FileSizeLimitExceeded) => {
                    drop(kbf);
                    let new_name = inner.new_file()?;
                    inner.current_file = Some(new_name.clone());
                    let kbf = inner.files.get_mut(&new_name).unwrap();
                    kbf.add_blob(key, blob)?
                }
                Err(e) => return Err(e),
            }
        };

        let owner = inner.current_file.clone().unwrap();
        inner.key_map.insert(stored_key.clone(), owner);
        Ok(stored_key)
    }
}

fn key_repr(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode(key),
    }
}
