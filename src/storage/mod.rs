use anyhow::Result;
use bytes::Bytes;

pub mod disk;
pub mod memory;
pub mod object;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use object::{IdHash, ObjectId, ObjectMetadata};

/// One bounded cache tier for fixed-size object blocks. Both built-in tiers
/// (memory, disk) satisfy this; a remote peer tier would slot in the same
/// way. Blocks are immutable once returned: implementations hand out
/// copy-out `Bytes`, so eviction never touches bytes a reader already holds.
pub trait BlockStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the block and refreshes its recency.
    fn get(&self, id: &ObjectId, index: u32) -> Option<Bytes>;

    /// Inserts or overwrites a block, refreshing recency and evicting
    /// least-recently-used blocks as needed to hold the tier's byte bound.
    fn put(&self, id: &ObjectId, index: u32, bytes: Bytes) -> Result<()>;

    /// Drops every block belonging to the object.
    fn remove_object(&self, id: &ObjectId);

    /// Resident payload bytes.
    fn usage(&self) -> u64;
}
