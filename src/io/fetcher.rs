//! Resolves logical array identifiers to chunked arrays.
//!
//! One fetcher owns one chunk cache; every array it opens shares that cache
//! and its byte budget. The fetcher is safe to share across concurrent units.

use super::chunk_cache::ChunkCache;
use super::zarr_reader::ChunkedArray;
use crate::batch::Metrics;
use crate::error::Result;
use object_store::ObjectStore;
use std::sync::Arc;

/// Opens chunked arrays addressed by `(collection, unit index, resolution)`.
pub struct ArrayFetcher {
    store: Arc<dyn ObjectStore>,
    root_template: String,
    cache: Arc<ChunkCache>,
    metrics: Option<Arc<Metrics>>,
}

impl ArrayFetcher {
    /// Create a fetcher over `store`.
    ///
    /// `root_template` may use `{collection}`, `{index}` and `{resolution}`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        root_template: impl Into<String>,
        cache_bytes: u64,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            store,
            root_template: root_template.into(),
            cache: Arc::new(ChunkCache::new(cache_bytes, metrics.clone())),
            metrics,
        }
    }

    /// Array root for a unit. Deterministic in its inputs.
    pub fn root_for(&self, collection_id: &str, unit_index: usize, resolution: &str) -> String {
        self.root_template
            .replace("{collection}", collection_id)
            .replace("{index}", &unit_index.to_string())
            .replace("{resolution}", resolution)
    }

    /// Open the array for one unit at one resolution level.
    pub async fn open(&self, collection_id: &str, unit_index: usize, resolution: &str) -> Result<ChunkedArray> {
        let root = self.root_for(collection_id, unit_index, resolution);
        tracing::debug!("Opening array {} for unit {} of {}", root, unit_index, collection_id);
        ChunkedArray::open(self.store.clone(), &root, self.cache.clone(), self.metrics.clone()).await
    }

    /// The cache shared by every array this fetcher opens.
    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }
}
