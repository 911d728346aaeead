//! LRU chunk cache with single-flight deduplication.
//!
//! Decoded chunk elements are cached per fetcher so that slicing several
//! channels out of the same chunk, or re-reading a plane, never goes back to
//! the remote store while the chunk is resident.
//!
//! - Eviction is by total byte size, least-recently-used first
//! - Concurrent requests for a chunk that is already being fetched wait on
//!   that fetch instead of issuing a second remote read

use crate::batch::Metrics;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

/// Identifies one chunk: the array root it belongs to plus its grid coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub root: String,
    pub coords: Vec<u64>,
}

impl ChunkKey {
    pub fn new(root: impl Into<String>, coords: &[u64]) -> Self {
        Self {
            root: root.into(),
            coords: coords.to_vec(),
        }
    }
}

/// Decoded chunk elements in C order. `None` means the chunk is absent in
/// the store and reads as the array fill value.
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    pub values: Option<Vec<f64>>,
}

impl DecodedChunk {
    /// Bytes charged against the cache budget.
    pub fn size_bytes(&self) -> usize {
        self.values
            .as_ref()
            .map_or(0, |v| v.len() * std::mem::size_of::<f64>())
    }
}

type FlightResult = std::result::Result<Arc<DecodedChunk>, String>;
type InFlight = DashMap<ChunkKey, broadcast::Sender<FlightResult>>;

/// Clears the leader's in-flight registration however `get_or_fetch` is
/// left, including when its future is dropped mid-fetch. Once the entry and
/// the leader's sender are gone, waiting followers see `Closed` and retry.
struct FlightGuard<'a> {
    in_flight: &'a InFlight,
    key: &'a ChunkKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(self.key);
    }
}

/// Byte-bounded LRU cache for decoded chunks.
pub struct ChunkCache {
    /// Cached chunks, most recently used at the front
    cache: RwLock<LruCache<ChunkKey, Arc<DecodedChunk>>>,

    /// In-flight fetches; late requesters subscribe instead of refetching
    in_flight: InFlight,

    /// Maximum cache size in bytes
    max_bytes: u64,

    /// Current cache size in bytes
    current_bytes: AtomicU64,

    metrics: Option<Arc<Metrics>>,
}

impl ChunkCache {
    /// Create a cache holding at most `max_bytes` of decoded chunk data.
    pub fn new(max_bytes: u64, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            cache: RwLock::new(LruCache::unbounded()),
            in_flight: DashMap::new(),
            max_bytes,
            current_bytes: AtomicU64::new(0),
            metrics,
        }
    }

    /// Get a chunk from cache or fetch it using the provided function.
    ///
    /// A failed fetch is not cached; the next request calls `fetch` again.
    /// If the task fetching a chunk is cancelled, requests waiting on it
    /// start their own fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: ChunkKey, fetch: F) -> Result<Arc<DecodedChunk>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DecodedChunk>>,
    {
        // Either join an in-flight fetch or become the one doing it
        let tx = loop {
            if let Some(chunk) = self.lookup(&key).await {
                if let Some(ref m) = self.metrics {
                    m.add_cache_hit();
                }
                return Ok(chunk);
            }

            let mut rx = match self.in_flight.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    let (tx, _) = broadcast::channel(1);
                    entry.insert(tx.clone());
                    break tx;
                }
                Entry::Occupied(entry) => entry.get().subscribe(),
            };

            if let Some(ref m) = self.metrics {
                m.add_cache_coalesced();
            }
            match rx.recv().await {
                Ok(Ok(chunk)) => return Ok(chunk),
                Ok(Err(message)) => {
                    return Err(Error::transport(&key.root, format!("coalesced fetch failed: {message}")))
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("Fetch of chunk {:?} from {} was abandoned, retrying", key.coords, key.root);
                }
                Err(e) => return Err(Error::transport(&key.root, format!("broadcast channel error: {e}"))),
            }
        };

        let _guard = FlightGuard {
            in_flight: &self.in_flight,
            key: &key,
        };

        // A previous leader may have finished between the lookup and registration
        if let Some(chunk) = self.lookup(&key).await {
            let _ = tx.send(Ok(chunk.clone()));
            return Ok(chunk);
        }

        match fetch().await {
            Ok(chunk) => {
                let chunk = Arc::new(chunk);
                self.insert(key.clone(), chunk.clone()).await;

                if let Some(ref m) = self.metrics {
                    m.add_cache_miss();
                    m.set_cache_bytes(self.current_bytes());
                }

                let _ = tx.send(Ok(chunk.clone()));
                Ok(chunk)
            }
            Err(e) => {
                let _ = tx.send(Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn lookup(&self, key: &ChunkKey) -> Option<Arc<DecodedChunk>> {
        // LruCache::get promotes the entry, so it needs the write lock
        let mut cache = self.cache.write().await;
        cache.get(key).cloned()
    }

    /// Insert a chunk, evicting least-recently-used entries until it fits.
    /// Chunks larger than the whole budget are served but never cached.
    async fn insert(&self, key: ChunkKey, chunk: Arc<DecodedChunk>) {
        let size = chunk.size_bytes() as u64;
        if size > self.max_bytes {
            tracing::debug!(
                "Chunk {:?} of {} bytes exceeds cache budget {}, not caching",
                key.coords, size, self.max_bytes
            );
            return;
        }

        let mut cache = self.cache.write().await;
        if let Some(old) = cache.pop(&key) {
            self.current_bytes.fetch_sub(old.size_bytes() as u64, Ordering::Relaxed);
        }

        while self.current_bytes.load(Ordering::Relaxed) + size > self.max_bytes {
            match cache.pop_lru() {
                Some((evicted_key, evicted)) => {
                    tracing::debug!("Evicting chunk {:?} from {}", evicted_key.coords, evicted_key.root);
                    self.current_bytes.fetch_sub(evicted.size_bytes() as u64, Ordering::Relaxed);
                }
                None => break,
            }
        }

        cache.put(key, chunk);
        self.current_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Whether a chunk is currently resident (does not promote it).
    pub async fn contains(&self, key: &ChunkKey) -> bool {
        self.cache.read().await.contains(key)
    }

    /// Get the current cache size in bytes.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Get the maximum cache size in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Get the number of cached chunks.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Check if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Drop every cached chunk.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.set_cache_bytes(0);
        }
    }
}
