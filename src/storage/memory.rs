use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use bytes::Bytes;
use indexmap::IndexMap;

use crate::metrics;
use crate::storage::object::{IdHash, ObjectId};
use crate::storage::BlockStore;

type BlockKey = (IdHash, u32);

pub struct MemoryStore {
    max_bytes: u64,
    usage: AtomicU64,
    // insertion order doubles as recency order: front is coldest
    blocks: Mutex<IndexMap<BlockKey, Bytes>>,
}

impl MemoryStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            usage: AtomicU64::new(0),
            blocks: Mutex::new(IndexMap::new()),
        }
    }
}

impl BlockStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, id: &ObjectId, index: u32) -> Option<Bytes> {
        let key = (id.hash(), index);
        let mut blocks = self.blocks.lock().expect("memory blocks");
        let bytes = blocks.shift_remove(&key)?;
        blocks.insert(key, bytes.clone());
        Some(bytes)
    }

    fn put(&self, id: &ObjectId, index: u32, bytes: Bytes) -> Result<()> {
        let len = bytes.len() as u64;
        if len > self.max_bytes {
            log::debug!("memory store: block {}#{index} larger than budget, not stored", id);
            return Ok(());
        }
        let key = (id.hash(), index);
        let mut blocks = self.blocks.lock().expect("memory blocks");
        let mut usage = self.usage.load(Ordering::Relaxed);
        if let Some(old) = blocks.shift_remove(&key) {
            usage -= old.len() as u64;
        }
        blocks.insert(key, bytes);
        usage += len;
        while usage > self.max_bytes {
            let Some((victim, old)) = blocks.shift_remove_index(0) else {
                break;
            };
            usage -= old.len() as u64;
            metrics::record_eviction("memory", old.len() as u64);
            log::debug!("memory store: evicted block {}#{}", victim.0.to_hex(), victim.1);
        }
        self.usage.store(usage, Ordering::Relaxed);
        Ok(())
    }

    fn remove_object(&self, id: &ObjectId) {
        let hash = id.hash();
        let mut blocks = self.blocks.lock().expect("memory blocks");
        let victims: Vec<BlockKey> = blocks
            .keys()
            .filter(|(h, _)| *h == hash)
            .copied()
            .collect();
        let mut freed = 0u64;
        for key in victims {
            if let Some(old) = blocks.shift_remove(&key) {
                freed += old.len() as u64;
            }
        }
        self.usage.fetch_sub(freed, Ordering::Relaxed);
    }

    fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn put_and_get() {
        let store = MemoryStore::new(1024);
        let id = ObjectId::new("a");
        store.put(&id, 0, block(1, 100)).unwrap();
        assert_eq!(store.get(&id, 0), Some(block(1, 100)));
        assert_eq!(store.get(&id, 1), None);
        assert_eq!(store.usage(), 100);
    }

    #[test]
    fn usage_never_exceeds_budget() {
        let store = MemoryStore::new(250);
        let id = ObjectId::new("a");
        for i in 0..10 {
            store.put(&id, i, block(i as u8, 100)).unwrap();
            assert!(store.usage() <= 250, "usage {} after put {}", store.usage(), i);
        }
        assert_eq!(store.usage(), 200);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let store = MemoryStore::new(300);
        let id = ObjectId::new("a");
        store.put(&id, 0, block(0, 100)).unwrap();
        store.put(&id, 1, block(1, 100)).unwrap();
        store.put(&id, 2, block(2, 100)).unwrap();

        // touching block 0 makes block 1 the eviction victim
        assert!(store.get(&id, 0).is_some());
        store.put(&id, 3, block(3, 100)).unwrap();

        assert!(store.get(&id, 1).is_none());
        assert!(store.get(&id, 0).is_some());
        assert!(store.get(&id, 2).is_some());
        assert!(store.get(&id, 3).is_some());
    }

    #[test]
    fn overwrite_does_not_leak_usage() {
        let store = MemoryStore::new(1024);
        let id = ObjectId::new("a");
        store.put(&id, 0, block(1, 100)).unwrap();
        store.put(&id, 0, block(2, 60)).unwrap();
        assert_eq!(store.usage(), 60);
        assert_eq!(store.get(&id, 0), Some(block(2, 60)));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let store = MemoryStore::new(50);
        let id = ObjectId::new("a");
        store.put(&id, 0, block(1, 100)).unwrap();
        assert_eq!(store.usage(), 0);
        assert!(store.get(&id, 0).is_none());
    }

    #[test]
    fn remove_object_only_touches_one_key() {
        let store = MemoryStore::new(1024);
        let a = ObjectId::new("a");
        let b = ObjectId::new("b");
        store.put(&a, 0, block(1, 100)).unwrap();
        store.put(&a, 1, block(1, 100)).unwrap();
        store.put(&b, 0, block(2, 100)).unwrap();

        store.remove_object(&a);
        assert!(store.get(&a, 0).is_none());
        assert!(store.get(&a, 1).is_none());
        assert_eq!(store.get(&b, 0), Some(block(2, 100)));
        assert_eq!(store.usage(), 100);
    }
}
