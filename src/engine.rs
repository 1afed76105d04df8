use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::RwLock;

use crate::hydrator::{Hydrator, Probe};
use crate::metrics;
use crate::singleflight::Group;
use crate::storage::{BlockStore, ObjectId, ObjectMetadata};

type FlightResult<T> = std::result::Result<T, Arc<anyhow::Error>>;

/// Outcome of a cache lookup. NotCacheable is a control signal for the HTTP
/// layer to proxy the object through uncached, not a failure.
pub enum Lookup {
    Cacheable(CacheHandle),
    NotCacheable,
}

pub struct CacheEngine {
    block_size: u64,
    hydrator: Arc<dyn Hydrator>,
    // fastest tier first; lookups fall through, hits promote upward
    tiers: Vec<Arc<dyn BlockStore>>,
    index: RwLock<HashMap<String, Arc<ObjectMetadata>>>,
    probes: Group<FlightResult<Arc<Probe>>>,
    hydrations: Group<FlightResult<Bytes>>,
}

impl CacheEngine {
    pub fn new(
        block_size: u64,
        hydrator: Arc<dyn Hydrator>,
        tiers: Vec<Arc<dyn BlockStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            hydrator,
            tiers,
            index: RwLock::new(HashMap::new()),
            probes: Group::new(),
            hydrations: Group::new(),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub async fn get(self: Arc<Self>, key: &str, client_headers: &HeaderMap) -> Result<Lookup> {
        let id = ObjectId::new(key);
        let now = SystemTime::now();

        let cached = { self.index.read().await.get(key).cloned() };
        if let Some(meta) = &cached {
            if meta.is_fresh(now) {
                return Ok(Lookup::Cacheable(CacheHandle {
                    id,
                    meta: Arc::clone(meta),
                    engine: self,
                }));
            }
        }

        let probe = self.probe(key, client_headers.clone()).await?;

        if !probe.decision.store {
            metrics::record_not_cacheable();
            log::debug!("{key}: not cacheable: {}", probe.decision.reasons.join("; "));
            if cached.is_some() {
                self.index.write().await.remove(key);
                for tier in &self.tiers {
                    tier.remove_object(&id);
                }
            }
            return Ok(Lookup::NotCacheable);
        }

        let meta = Arc::new(probe.metadata.clone());
        if let Some(old) = &cached {
            if !old.same_identity(&meta) {
                log::info!("{key}: origin object changed, dropping cached blocks");
                for tier in &self.tiers {
                    tier.remove_object(&id);
                }
            }
        }
        self.index.write().await.insert(key.to_string(), Arc::clone(&meta));

        Ok(Lookup::Cacheable(CacheHandle {
            id,
            meta,
            engine: self,
        }))
    }

    async fn probe(&self, key: &str, client_headers: HeaderMap) -> Result<Arc<Probe>> {
        let hydrator = Arc::clone(&self.hydrator);
        let key_owned = key.to_string();
        self.probes
            .join(format!("meta:{key}"), move || async move {
                match hydrator.fetch_metadata(&key_owned, client_headers).await {
                    Ok(probe) => Ok(Arc::new(probe)),
                    Err(err) => Err(Arc::new(err)),
                }
            })
            .await
            .map_err(|err| anyhow!("{err:#}"))
    }

    /// Resolves one block: memory, then disk, then a deduplicated origin
    /// fetch. A freshly hydrated block lands in every tier; a tier that
    /// fails to take it only loses the copy, the read still succeeds.
    pub(crate) async fn read_block(
        &self,
        id: &ObjectId,
        meta: &ObjectMetadata,
        index: u32,
    ) -> Result<Bytes> {
        for (depth, tier) in self.tiers.iter().enumerate() {
            if let Some(bytes) = tier.get(id, index) {
                metrics::record_tier_hit(tier.name());
                for upper in &self.tiers[..depth] {
                    if let Err(err) = upper.put(id, index, bytes.clone()) {
                        log::warn!("{id}: promote block {index} to {} failed: {err}", upper.name());
                    }
                }
                return Ok(bytes);
            }
        }
        metrics::record_block_miss();

        let start = index as u64 * self.block_size;
        let end = meta.size.min(start + self.block_size);
        if start >= end {
            return Err(anyhow!("{id}: block {index} lies outside the object"));
        }

        let hydrator = Arc::clone(&self.hydrator);
        let tiers = self.tiers.clone();
        let id_owned = id.clone();
        self.hydrations
            .join(format!("{}:{index}", id.hash_str()), move || async move {
                metrics::record_hydration();
                let bytes = match hydrator.fetch_range(id_owned.path(), start, end).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        metrics::record_hydration_error();
                        return Err(Arc::new(err));
                    }
                };
                if bytes.len() as u64 != end - start {
                    metrics::record_hydration_error();
                    return Err(Arc::new(anyhow!(
                        "{id_owned}: hydrated block {index} has {} bytes, expected {}",
                        bytes.len(),
                        end - start
                    )));
                }
                for tier in &tiers {
                    if let Err(err) = tier.put(&id_owned, index, bytes.clone()) {
                        log::warn!("{id_owned}: store block {index} in {} failed: {err}", tier.name());
                    }
                }
                Ok(bytes)
            })
            .await
            .map_err(|err| anyhow!("{err:#}"))
    }
}

/// Size-known random-access view of a cached object. Reads resolve to
/// blocks through the engine; any span within `[0, size)` can be read in
/// any order, repeatedly.
#[derive(Clone)]
pub struct CacheHandle {
    id: ObjectId,
    meta: Arc<ObjectMetadata>,
    engine: Arc<CacheEngine>,
}

impl CacheHandle {
    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn metadata(&self) -> &ObjectMetadata {
        &self.meta
    }

    pub fn block_size(&self) -> u64 {
        self.engine.block_size
    }

    pub async fn read_at(&self, offset: u64, length: u64) -> Result<Bytes> {
        let size = self.meta.size;
        if offset >= size || length == 0 {
            return Ok(Bytes::new());
        }
        let end = size.min(offset.saturating_add(length));
        let bs = self.engine.block_size;
        let first = offset / bs;
        let last = (end - 1) / bs;

        if first == last {
            let block = self.engine.read_block(&self.id, &self.meta, first as u32).await?;
            let block_start = first * bs;
            let from = (offset - block_start) as usize;
            let to = (end - block_start) as usize;
            return Ok(block.slice(from..to));
        }

        let mut buf = BytesMut::with_capacity((end - offset) as usize);
        for index in first..=last {
            let block = self.engine.read_block(&self.id, &self.meta, index as u32).await?;
            let block_start = index * bs;
            let from = offset.max(block_start) - block_start;
            let to = (end - block_start).min(block.len() as u64);
            buf.extend_from_slice(&block[from as usize..to as usize]);
        }
        Ok(buf.freeze())
    }
}
