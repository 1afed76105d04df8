use anyhow::Result;
use bytes::Bytes;

use crate::engine::CacheHandle;

/// Streams a `[start, end)` window of a cached object one block-bounded
/// chunk at a time. Nothing beyond the current chunk is held in memory, and
/// `rewind` allows re-reading any earlier offset.
pub struct LazyRangeReader {
    handle: CacheHandle,
    pos: u64,
    end: u64,
}

impl LazyRangeReader {
    pub fn new(handle: CacheHandle, start: u64, end: u64) -> Self {
        let end = end.min(handle.size());
        Self {
            handle,
            pos: start.min(end),
            end,
        }
    }

    pub fn full(handle: CacheHandle) -> Self {
        let end = handle.size();
        Self::new(handle, 0, end)
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    pub fn rewind(&mut self, offset: u64) {
        self.pos = offset.min(self.end);
    }

    /// Next chunk, ending at the next block boundary or the window end,
    /// whichever comes first. `None` once the window is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let block_size = self.handle.block_size();
        let boundary = (self.pos / block_size + 1) * block_size;
        let chunk_end = boundary.min(self.end);
        let chunk = self.handle.read_at(self.pos, chunk_end - self.pos).await?;
        self.pos += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Random access within the window, independent of the streaming
    /// position.
    pub async fn read_at(&self, offset: u64, length: u64) -> Result<Bytes> {
        let offset = offset.min(self.end);
        let length = length.min(self.end - offset);
        self.handle.read_at(offset, length).await
    }
}
