//! A single capped, append-heavy container: the "KBF file".
//!
//! On-disk layout is `[header][data region, may contain gaps][directory]`.
//! Structurally this follows `toydb`'s `bitcask.rs`: a single owning struct
//! (`KbFile`, playing the role of `BitCask`) holding both the open `File`
//! and the in-memory directory, doing its own positional I/O directly
//! rather than splitting that out into a separate log type.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use indexmap::IndexMap;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::storage::codec::{
    self, next_page_offset, Header, HEADER_SIZE, MAX_BLOB_SIZE, MAX_FILE_SIZE, MAX_KEY_SIZE,
    MAX_OFFSET, PAGE_SIZE,
};

/// Size and offset metadata for one stored blob, as returned by `meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobMeta {
    pub size: u64,
}

/// In-memory directory: key -> (offset, size), in insertion-mutation order.
///
/// A `BTreeMap` would reorder entries by key bytes, which would violate the
/// format's invariant that the on-disk directory is the packed entries in
/// insertion-mutation order. `IndexMap` preserves it.
type Directory = IndexMap<Vec<u8>, (u64, u64)>;

/// An open KBF container.
pub struct KbFile {
    name: String,
    path: PathBuf,
    file: File,
    data_offset: u64,
    directory_offset: u64,
    free_space: u64,
    file_size: u64,
    directory: Directory,
    /// Per-instance cap on `directory_offset`, always `<= codec::MAX_FILE_SIZE`.
    /// Overridable (see `create_with_limit`) so callers can exercise rollover
    /// without allocating a real 1 GiB file.
    max_file_size: u64,
}

impl KbFile {
    /// Creates a new, empty container at `path`. Fails if the path already
    /// exists or cannot be created.
    pub fn create(path: impl AsRef<Path>, name: Option<String>) -> Result<Self> {
        Self::create_with_limit(path, name, MAX_FILE_SIZE)
    }

    /// Like [`KbFile::create`], but caps this container's directory growth
    /// at `max_file_size` instead of the format's full `MAX_FILE_SIZE`.
    pub fn create_with_limit(
        path: impl AsRef<Path>,
        name: Option<String>,
        max_file_size: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.try_lock_exclusive()?;

        let data_offset = HEADER_SIZE;
        let directory_offset = next_page_offset(data_offset + PAGE_SIZE);
        let name = name.unwrap_or_else(|| name_from_path(&path));

        let mut kbf = KbFile {
            name,
            path,
            file,
            data_offset,
            directory_offset,
            free_space: data_offset,
            file_size: directory_offset,
            directory: Directory::new(),
            max_file_size: max_file_size.min(MAX_FILE_SIZE),
        };
        kbf.write_header()?;
        kbf.write_directory()?;
        log::info!("created container {} at {}", kbf.name, kbf.path.display());
        Ok(kbf)
    }

    /// Opens an existing container, validating its header and reading its
    /// directory into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.try_lock_exclusive()?;

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_buf)?;
        let header = Header::decode(&header_buf)?;

        let mut kbf = KbFile {
            name: name_from_path(&path),
            path,
            file,
            data_offset: header.data_offset,
            directory_offset: header.directory_offset,
            free_space: header.data_offset,
            file_size: 0,
            directory: Directory::new(),
            max_file_size: MAX_FILE_SIZE,
        };
        kbf.read_directory()?;
        kbf.file_size = kbf.file.metadata()?.len();
        log::info!(
            "opened container {} ({} live keys)",
            kbf.name,
            kbf.directory.len()
        );
        Ok(kbf)
    }

    /// Releases the file handle. Consuming `self` makes further use a
    /// compile error rather than a runtime one.
    pub fn close(self) {
        drop(self);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of live blob data (`free_space - data_offset`).
    pub fn size(&self) -> u64 {
        self.free_space - self.data_offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Overrides the cap applied to future directory growth. Used when a
    /// container opened from disk should honor a caller-supplied limit
    /// instead of the format's full `MAX_FILE_SIZE`.
    pub fn set_max_file_size(&mut self, max_file_size: u64) {
        self.max_file_size = max_file_size.min(MAX_FILE_SIZE);
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.directory.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.directory.keys()
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let (offset, size) = *self
            .directory
            .get(key)
            .ok_or_else(|| Error::NotFound(key_repr(key)))?;
        let size = usize::try_from(size)
            .map_err(|_| Error::CorruptFile("blob size does not fit in memory".into()))?;
        let mut buf = vec![0u8; size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn size_of(&self, key: &[u8]) -> Result<u64> {
        self.directory
            .get(key)
            .map(|(_, size)| *size)
            .ok_or_else(|| Error::NotFound(key_repr(key)))
    }

    pub fn meta(&self, key: &[u8]) -> Result<BlobMeta> {
        self.size_of(key).map(|size| BlobMeta { size })
    }

    /// Stores `blob` under `key`, or a freshly generated random key if
    /// `key` is `None`. Returns the key the blob was stored under.
    pub fn add_blob(&mut self, key: Option<Vec<u8>>, blob: &[u8]) -> Result<Vec<u8>> {
        let key = match key {
            Some(key) => key,
            None => self.generate_unique_key(),
        };
        if key.len() as u64 > MAX_KEY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "key is too long: {} > {MAX_KEY_SIZE}",
                key.len()
            )));
        }
        if blob.is_empty() {
            return Err(Error::InvalidArgument("blob must not be empty".into()));
        }
        if blob.len() as u64 > MAX_BLOB_SIZE {
            return Err(Error::InvalidArgument(format!(
                "blob is too long: {} > {MAX_BLOB_SIZE}",
                blob.len()
            )));
        }

        if self.directory.contains_key(&key) {
            self.delete(&key)?;
        }

        self.recompute_free_space();
        let store_at = self.find_store_offset(blob.len() as u64)?;
        if store_at > MAX_OFFSET {
            return Err(Error::InvalidArgument(format!(
                "offset is too long: {store_at} > {MAX_OFFSET}"
            )));
        }

        self.append_blob(&key, blob, store_at)?;
        Ok(key)
    }

    /// Removes `key`. Does not reclaim its byte range; that only happens on
    /// `compact`.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.directory.shift_remove(key).is_none() {
            return Err(Error::NotFound(key_repr(key)));
        }
        self.write_directory()?;
        Ok(())
    }

    /// Rewrites every live blob contiguously starting at `data_offset`,
    /// eliminating gaps, then rewrites the directory to match.
    pub fn compact(&mut self) -> Result<()> {
        let mut entries: Vec<(Vec<u8>, u64, u64)> = self
            .directory
            .iter()
            .map(|(key, &(offset, size))| (key.clone(), offset, size))
            .collect();
        entries.sort_by_key(|&(_, offset, _)| offset);

        let mut new_directory = Directory::new();
        let mut write_off = self.data_offset;
        for (key, offset, size) in entries {
            if offset != write_off {
                let usize_size = usize::try_from(size)
                    .map_err(|_| Error::CorruptFile("blob size does not fit in memory".into()))?;
                let mut buf = vec![0u8; usize_size];
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(&mut buf)?;
                self.file.seek(SeekFrom::Start(write_off))?;
                self.file.write_all(&buf)?;
            }
            new_directory.insert(key, (write_off, size));
            write_off += size;
        }

        self.free_space = write_off;
        self.directory_offset = next_page_offset(write_off);
        self.directory = new_directory;
        self.write_header()?;
        self.write_directory()?;
        log::info!(
            "compacted container {}: {} live keys, free_space={}",
            self.name,
            self.directory.len(),
            self.free_space
        );
        Ok(())
    }

    /// Bytes that `compact` would reclaim: the gap between `free_space` and
    /// the sum of live blob sizes, i.e. everything that isn't live data.
    pub fn reclaimable_bytes(&self) -> u64 {
        let live: u64 = self.directory.values().map(|(_, size)| size).sum();
        self.size().saturating_sub(live)
    }

    fn generate_unique_key(&self) -> Vec<u8> {
        loop {
            let mut raw = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut raw);
            let key = hex::encode(raw).into_bytes();
            if !self.directory.contains_key(&key) {
                return key;
            }
        }
    }

    fn recompute_free_space(&mut self) {
        self.free_space = self
            .directory
            .values()
            .map(|&(offset, size)| offset + size)
            .max()
            .unwrap_or(self.data_offset);
    }

    /// Gap-fitting pass: the first adjacent pair of entries (sorted by
    /// offset) with enough room between them wins; otherwise the blob is
    /// appended at `free_space`, growing the directory region if needed.
    fn find_store_offset(&mut self, blob_len: u64) -> Result<u64> {
        let mut by_offset: Vec<(u64, u64)> = self.directory.values().copied().collect();
        by_offset.sort_unstable();

        for window in by_offset.windows(2) {
            let (offset, size) = window[0];
            let (next_offset, _) = window[1];
            if next_offset >= offset + size + blob_len {
                return Ok(offset + size);
            }
        }

        self.ensure_room(blob_len)?;
        Ok(self.free_space)
    }

    /// Grows the directory region in `PAGE_SIZE` increments until there is
    /// room for `blob_len` bytes past `free_space`.
    fn ensure_room(&mut self, blob_len: u64) -> Result<()> {
        let mut available = self.directory_offset - self.free_space;
        let mut new_directory_offset = self.directory_offset;
        while available < blob_len {
            new_directory_offset += PAGE_SIZE;
            available += PAGE_SIZE;
        }
        if new_directory_offset > self.max_file_size {
            return Err(Error::FileSizeLimitExceeded);
        }
        if new_directory_offset > self.directory_offset {
            self.directory_offset = new_directory_offset;
            self.write_directory()?;
            self.write_header()?;
        }
        Ok(())
    }

    fn append_blob(&mut self, key: &[u8], blob: &[u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(blob)?;
        self.free_space = offset + blob.len() as u64;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&codec::pack_entry(key, offset, blob.len() as u64))?;
        let end = self.file.stream_position()?;
        self.file.set_len(end)?;
        self.file_size = end;

        self.directory.insert(key.to_vec(), (offset, blob.len() as u64));
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = Header {
            data_offset: self.data_offset,
            directory_offset: self.directory_offset,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        Ok(())
    }

    /// Rewrites the whole directory region from the in-memory map and
    /// truncates the file to exactly its end.
    fn write_directory(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.directory_offset))?;
        for (key, &(offset, size)) in &self.directory {
            self.file.write_all(&codec::pack_entry(key, offset, size))?;
        }
        let end = self.file.stream_position()?;
        self.file.set_len(end)?;
        self.file_size = end;
        Ok(())
    }

    fn read_directory(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.directory_offset))?;
        let mut data = Vec::new();
        self.file.read_to_end(&mut data)?;

        let mut directory = Directory::new();
        let mut free_space = self.data_offset;
        let mut i = 0;
        while i < data.len() {
            let (entry, consumed) = codec::unpack_entry(&data[i..])?;
            free_space = free_space.max(entry.offset + entry.size);
            directory.insert(entry.key, (entry.offset, entry.size));
            i += consumed;
        }
        self.directory = directory;
        self.free_space = free_space;
        Ok(())
    }
}

fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn key_repr(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path_in(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn create_fails_if_path_exists() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "a.kbf");
        KbFile::create(&path, None).unwrap();
        assert!(KbFile::create(&path, None).is_err());
    }

    #[test]
    fn put_close_reopen_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "s1.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        kbf.add_blob(Some(b"foo".to_vec()), b"hello world").unwrap();
        kbf.close();

        let mut kbf = KbFile::open(&path).unwrap();
        assert_eq!(kbf.get(b"foo").unwrap(), b"hello world");
    }

    #[test]
    fn gap_reuse_after_delete() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "s2.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();

        let four_kib = vec![1u8; 4096];
        kbf.add_blob(Some(b"a".to_vec()), &four_kib).unwrap();
        kbf.add_blob(Some(b"b".to_vec()), &four_kib).unwrap();
        kbf.add_blob(Some(b"c".to_vec()), &four_kib).unwrap();
        kbf.delete(b"b").unwrap();

        let three_kib = vec![2u8; 3072];
        kbf.add_blob(Some(b"d".to_vec()), &three_kib).unwrap();

        let a_offset = kbf.size_of(b"a").unwrap();
        let mut sorted: Vec<(Vec<u8>, u64)> = kbf
            .directory
            .iter()
            .map(|(k, &(o, _))| (k.clone(), o))
            .collect();
        sorted.sort_by_key(|&(_, o)| o);
        let names: Vec<&[u8]> = sorted.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(names, vec![b"a".as_slice(), b"d".as_slice(), b"c".as_slice()]);

        let d_offset = kbf.directory.get(b"d".as_slice()).unwrap().0;
        assert_eq!(d_offset, a_offset + 4096);
    }

    #[test]
    fn gap_reuse_lands_in_first_sufficient_gap() {
        // Entries at offset 22 (size 100) and 200 (size 100); a 50-byte put
        // should land at 122, the first sufficient gap.
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "gap.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        kbf.append_blob(b"a", &vec![0u8; 100], 22).unwrap();
        kbf.append_blob(b"b", &vec![0u8; 100], 200).unwrap();

        kbf.recompute_free_space();
        let offset = kbf.find_store_offset(50).unwrap();
        assert_eq!(offset, 122);
    }

    #[test]
    fn round_trip_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "rt.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();

        kbf.add_blob(Some(b"k1".to_vec()), b"v1").unwrap();
        kbf.add_blob(Some(b"k2".to_vec()), b"v2").unwrap();
        kbf.add_blob(Some(b"k1".to_vec()), b"v1-updated").unwrap();

        assert_eq!(kbf.get(b"k1").unwrap(), b"v1-updated");
        assert_eq!(kbf.get(b"k2").unwrap(), b"v2");
        assert_eq!(kbf.directory.len(), 2);
    }

    #[test]
    fn directory_bytes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "faithful.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        for i in 0..20u32 {
            kbf.add_blob(Some(format!("key-{i}").into_bytes()), format!("value-{i}").as_bytes())
                .unwrap();
        }
        kbf.delete(b"key-3").unwrap();
        let before: std::collections::HashMap<_, _> = kbf.directory.clone().into_iter().collect();
        kbf.close();

        let kbf = KbFile::open(&path).unwrap();
        let after: std::collections::HashMap<_, _> = kbf.directory.clone().into_iter().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn non_overlap_after_many_mutations() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "overlap.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        for i in 0..50u32 {
            kbf.add_blob(Some(format!("k{i}").into_bytes()), &vec![i as u8; 37])
                .unwrap();
            if i % 7 == 0 {
                kbf.delete(format!("k{}", i.saturating_sub(1)).as_bytes())
                    .ok();
            }
        }
        let mut entries: Vec<(u64, u64)> = kbf.directory.values().copied().collect();
        entries.sort_unstable();
        for pair in entries.windows(2) {
            let (o0, s0) = pair[0];
            let (o1, _) = pair[1];
            assert!(o0 + s0 <= o1);
        }
    }

    #[test]
    fn compaction_preserves_contents_and_removes_gaps() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "compact.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        for i in 0..10u32 {
            kbf.add_blob(Some(format!("k{i}").into_bytes()), format!("v{i}").as_bytes())
                .unwrap();
        }
        kbf.delete(b"k3").unwrap();
        kbf.delete(b"k7").unwrap();

        let mut expected = Vec::new();
        for i in 0..10u32 {
            if i == 3 || i == 7 {
                continue;
            }
            expected.push((format!("k{i}").into_bytes(), format!("v{i}").into_bytes()));
        }

        kbf.compact().unwrap();

        for (key, value) in &expected {
            assert_eq!(&kbf.get(key).unwrap(), value);
        }
        let live_total: u64 = kbf.directory.values().map(|(_, size)| size).sum();
        assert_eq!(kbf.free_space, kbf.data_offset + live_total);

        let mut entries: Vec<(u64, u64)> = kbf.directory.values().copied().collect();
        entries.sort_unstable();
        let mut write_off = kbf.data_offset;
        for (offset, size) in entries {
            assert_eq!(offset, write_off);
            write_off += size;
        }
    }

    #[test]
    fn grow_in_page_increments() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "grow.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        let original_dir_offset = kbf.directory_offset;

        // Fill past the first page so the directory must grow.
        let blob = vec![0u8; PAGE_SIZE as usize];
        kbf.add_blob(Some(b"big".to_vec()), &blob).unwrap();

        assert!(kbf.directory_offset > original_dir_offset);
        assert_eq!((kbf.directory_offset - original_dir_offset) % PAGE_SIZE, 0);
    }

    #[test]
    fn file_size_limit_exceeded_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "limit.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        // Force the directory right up against MAX_FILE_SIZE.
        kbf.directory_offset = MAX_FILE_SIZE;
        kbf.free_space = MAX_FILE_SIZE;

        let before_keys: Vec<_> = kbf.directory.keys().cloned().collect();
        let err = kbf.add_blob(Some(b"overflow".to_vec()), b"x").unwrap_err();
        assert!(matches!(err, Error::FileSizeLimitExceeded));
        let after_keys: Vec<_> = kbf.directory.keys().cloned().collect();
        assert_eq!(before_keys, after_keys);
    }

    #[test]
    fn rejects_empty_blob() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "invalid.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        assert!(matches!(
            kbf.add_blob(Some(b"k".to_vec()), b""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "missing.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        assert!(matches!(kbf.get(b"nope"), Err(Error::NotFound(_))));
        assert!(matches!(kbf.delete(b"nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn directory_growth_past_limit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "s3.kbf");
        let limit = HEADER_SIZE + 2 * PAGE_SIZE;
        let mut kbf = KbFile::create_with_limit(&path, None, limit).unwrap();

        // Fill the first page with blobs.
        for i in 0..8u32 {
            kbf.add_blob(Some(format!("k{i}").into_bytes()), &vec![0u8; 1000])
                .unwrap();
        }

        // Another put big enough to demand directory growth past the limit.
        let err = kbf.add_blob(Some(b"overflow".to_vec()), &vec![0u8; PAGE_SIZE as usize]);
        assert!(matches!(err, Err(Error::FileSizeLimitExceeded)));
    }

    #[test]
    fn random_key_generation_is_unique_and_hex() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "rand.kbf");
        let mut kbf = KbFile::create(&path, None).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..25 {
            let key = kbf.add_blob(None, b"x").unwrap();
            assert_eq!(key.len(), 16);
            assert!(key.iter().all(|b| b.is_ascii_hexdigit()));
            assert!(seen.insert(key));
        }
    }
}
