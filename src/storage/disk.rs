use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::Bytes;
use indexmap::IndexMap;

use crate::metrics;
use crate::storage::object::{IdHash, ObjectId};
use crate::storage::BlockStore;

type BlockKey = (IdHash, u32);

pub struct DiskStore {
    root: PathBuf,
    max_bytes: u64,
    cleaned_bytes: u64,
    usage: AtomicU64,
    // recency order, front is coldest; values are block lengths
    entries: Mutex<IndexMap<BlockKey, u64>>,
}

impl DiskStore {
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64, cleaned_bytes: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create cache dir {}", root.display()))?;
        let store = Self {
            root,
            max_bytes,
            cleaned_bytes,
            usage: AtomicU64::new(0),
            entries: Mutex::new(IndexMap::new()),
        };
        store.load_existing()?;
        Ok(store)
    }

    /// Rebuilds the usage counter and recency order from persisted block
    /// files, oldest modification time coldest. Files that do not parse as
    /// block names are removed.
    fn load_existing(&self) -> Result<()> {
        let mut found: Vec<(BlockKey, u64, SystemTime)> = Vec::new();
        for entry in walk_block_files(&self.root)? {
            let (path, meta) = entry;
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            match parse_block_name(name) {
                Some(key) => {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((key, meta.len(), mtime));
                }
                None => {
                    log::warn!("disk store: removing unrecognized file {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let mut entries = self.entries.lock().expect("disk entries");
        let mut usage = 0u64;
        for (key, len, _) in found {
            entries.insert(key, len);
            usage += len;
        }
        let count = entries.len();
        drop(entries);
        self.usage.store(usage, Ordering::Relaxed);
        log::info!(
            "disk store: loaded {count} blocks, {usage} bytes from {}",
            self.root.display()
        );

        // the configured bound may have shrunk since the blocks were written
        self.evict_overflow();
        Ok(())
    }

    fn evict_overflow(&self) {
        let victims = {
            let mut entries = self.entries.lock().expect("disk entries");
            let mut usage = self.usage.load(Ordering::Relaxed);
            let mut victims = Vec::new();
            if usage > self.max_bytes {
                while usage > self.cleaned_bytes {
                    let Some((key, len)) = entries.shift_remove_index(0) else {
                        break;
                    };
                    usage -= len;
                    victims.push((key, len));
                }
            }
            self.usage.store(usage, Ordering::Relaxed);
            victims
        };
        for ((hash, index), len) in victims {
            let path = hash.block_path(&self.root, index);
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("disk store: evicting {} failed: {err}", path.display());
            }
            metrics::record_eviction("disk", len);
        }
    }

    fn drop_entry(&self, key: BlockKey) {
        let mut entries = self.entries.lock().expect("disk entries");
        if let Some(len) = entries.shift_remove(&key) {
            self.usage.fetch_sub(len, Ordering::Relaxed);
        }
    }
}

impl BlockStore for DiskStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn get(&self, id: &ObjectId, index: u32) -> Option<Bytes> {
        let key = (id.hash(), index);
        {
            let mut entries = self.entries.lock().expect("disk entries");
            let len = entries.shift_remove(&key)?;
            entries.insert(key, len);
        }
        let path = id.hash().block_path(&self.root, index);
        match fs::read(&path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(err) => {
                // the file went missing underneath us; forget the entry
                log::warn!("disk store: read {} failed: {err}", path.display());
                self.drop_entry(key);
                None
            }
        }
    }

    fn put(&self, id: &ObjectId, index: u32, bytes: Bytes) -> Result<()> {
        let path = id.hash().block_path(&self.root, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;

        let key = (id.hash(), index);
        {
            let mut entries = self.entries.lock().expect("disk entries");
            let mut usage = self.usage.load(Ordering::Relaxed);
            if let Some(old) = entries.shift_remove(&key) {
                usage -= old;
            }
            entries.insert(key, bytes.len() as u64);
            usage += bytes.len() as u64;
            self.usage.store(usage, Ordering::Relaxed);
        }
        self.evict_overflow();
        Ok(())
    }

    fn remove_object(&self, id: &ObjectId) {
        let hash = id.hash();
        let victims: Vec<BlockKey> = {
            let mut entries = self.entries.lock().expect("disk entries");
            let victims: Vec<BlockKey> = entries
                .keys()
                .filter(|(h, _)| *h == hash)
                .copied()
                .collect();
            let mut freed = 0u64;
            for key in &victims {
                if let Some(len) = entries.shift_remove(key) {
                    freed += len;
                }
            }
            self.usage.fetch_sub(freed, Ordering::Relaxed);
            victims
        };
        for (hash, index) in victims {
            let _ = fs::remove_file(hash.block_path(&self.root, index));
        }
    }

    fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

fn walk_block_files(root: &Path) -> Result<Vec<(PathBuf, fs::Metadata)>> {
    let mut files = Vec::new();
    for level1 in fs::read_dir(root).with_context(|| format!("scan {}", root.display()))? {
        let level1 = level1?;
        if !level1.file_type()?.is_dir() {
            continue;
        }
        for level2 in fs::read_dir(level1.path())? {
            let level2 = level2?;
            if !level2.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(level2.path())? {
                let file = file?;
                if file.file_type()?.is_file() {
                    files.push((file.path(), file.metadata()?));
                }
            }
        }
    }
    Ok(files)
}

fn parse_block_name(name: &str) -> Option<BlockKey> {
    let (hex, index) = name.split_once('-')?;
    let hash = IdHash::from_hex(hex)?;
    if index.len() != 6 {
        return None;
    }
    let index: u32 = index.parse().ok()?;
    Some((hash, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024, 512).unwrap();
        let id = ObjectId::new("a");
        store.put(&id, 0, block(7, 100)).unwrap();
        assert_eq!(store.get(&id, 0), Some(block(7, 100)));
        assert_eq!(store.usage(), 100);
    }

    #[test]
    fn hard_bound_and_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1000, 600).unwrap();
        let id = ObjectId::new("a");
        for i in 0..6 {
            store.put(&id, i, block(i as u8, 200)).unwrap();
            assert!(store.usage() <= 1000, "usage {} after put {}", store.usage(), i);
        }
        // the sixth insert crossed the bound and cleaned down to the watermark
        assert_eq!(store.usage(), 600);
        assert!(store.get(&id, 0).is_none());
        assert!(store.get(&id, 2).is_none());
        assert!(store.get(&id, 3).is_some());
        assert!(store.get(&id, 5).is_some());
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1000, 400).unwrap();
        let id = ObjectId::new("a");
        for i in 0..5 {
            store.put(&id, i, block(i as u8, 200)).unwrap();
        }
        // refresh block 0 so blocks 1.. are the victims
        assert!(store.get(&id, 0).is_some());
        store.put(&id, 5, block(5, 200)).unwrap();

        assert!(store.get(&id, 1).is_none());
        assert!(store.get(&id, 2).is_none());
        assert_eq!(store.get(&id, 0), Some(block(0, 200)));
        assert_eq!(store.get(&id, 5), Some(block(5, 200)));
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::new("a");
        {
            let store = DiskStore::open(dir.path(), 4096, 2048).unwrap();
            store.put(&id, 0, block(1, 300)).unwrap();
            store.put(&id, 1, block(2, 300)).unwrap();
        }
        let store = DiskStore::open(dir.path(), 4096, 2048).unwrap();
        assert_eq!(store.usage(), 600);
        assert_eq!(store.get(&id, 0), Some(block(1, 300)));
        assert_eq!(store.get(&id, 1), Some(block(2, 300)));
    }

    #[test]
    fn restart_enforces_shrunken_bound() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::new("a");
        {
            let store = DiskStore::open(dir.path(), 4096, 2048).unwrap();
            for i in 0..8 {
                store.put(&id, i, block(i as u8, 100)).unwrap();
            }
        }
        let store = DiskStore::open(dir.path(), 500, 300).unwrap();
        assert!(store.usage() <= 300);
    }

    #[test]
    fn scan_removes_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let stray = dir.path().join("x").join("yy");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("not-a-block"), b"junk").unwrap();

        let store = DiskStore::open(dir.path(), 1024, 512).unwrap();
        assert_eq!(store.usage(), 0);
        assert!(!stray.join("not-a-block").exists());
    }

    #[test]
    fn remove_object_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 4096, 2048).unwrap();
        let a = ObjectId::new("a");
        let b = ObjectId::new("b");
        store.put(&a, 0, block(1, 100)).unwrap();
        store.put(&b, 0, block(2, 100)).unwrap();

        store.remove_object(&a);
        assert!(store.get(&a, 0).is_none());
        assert_eq!(store.usage(), 100);
        assert!(!a.hash().block_path(dir.path(), 0).exists());
        assert!(b.hash().block_path(dir.path(), 0).exists());
    }
}
