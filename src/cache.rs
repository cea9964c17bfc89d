//! By-round beacon caching
//!
//! A bounded mapping from round number to verified beacon, shared by the
//! caching client, the trust walk and the gossip validator. Entries are
//! immutable once stored; eviction approximates LRU and callers must not
//! depend on its ordering.

use crate::beacon::Beacon;
use crate::chain::ChainInfo;
use crate::client::{BeaconStream, Client};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tracing::{debug, trace};

/// Round-indexed beacon store.
pub trait Cache: Send + Sync {
    /// Cached beacon for `round`, if present.
    fn try_get(&self, round: u64) -> Option<Beacon>;

    /// Store a beacon under `round`.
    fn add(&self, round: u64, beacon: &Beacon);

    /// Number of cached entries.
    fn len(&self) -> usize;
}

/// Build a cache of the given capacity; capacity 0 yields a no-op cache.
pub fn new_cache(capacity: usize) -> Arc<dyn Cache> {
    if capacity == 0 {
        Arc::new(NoopCache)
    } else {
        Arc::new(RoundCache::new(capacity))
    }
}

struct CacheEntry {
    beacon: Beacon,
    last_accessed: Instant,
}

/// Bounded in-memory cache with least-recently-used eviction.
pub struct RoundCache {
    entries: Mutex<HashMap<u64, CacheEntry>>,
    capacity: usize,
    stats: Mutex<CacheStats>,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total entries evicted
    pub evictions: u64,
}

impl RoundCache {
    /// Create a cache holding at most `capacity` beacons.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Snapshot of hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().unwrap()
    }

    fn evict_lru(&self, entries: &mut HashMap<u64, CacheEntry>) {
        let lru_round = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(round, _)| *round);

        if let Some(round) = lru_round {
            entries.remove(&round);
            self.stats.lock().unwrap().evictions += 1;
            debug!(round, "cache eviction");
        }
    }
}

impl Cache for RoundCache {
    fn try_get(&self, round: u64) -> Option<Beacon> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&round) {
            entry.last_accessed = Instant::now();
            self.stats.lock().unwrap().hits += 1;
            trace!(round, "cache hit");
            return Some(entry.beacon.clone());
        }
        self.stats.lock().unwrap().misses += 1;
        None
    }

    fn add(&self, round: u64, beacon: &Beacon) {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&round) {
            return;
        }
        if entries.len() >= self.capacity {
            self.evict_lru(&mut entries);
        }
        entries.insert(
            round,
            CacheEntry {
                beacon: beacon.clone(),
                last_accessed: Instant::now(),
            },
        );
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Cache that stores nothing, used when caching is disabled.
pub struct NoopCache;

impl Cache for NoopCache {
    fn try_get(&self, _round: u64) -> Option<Beacon> {
        None
    }

    fn add(&self, _round: u64, _beacon: &Beacon) {}

    fn len(&self) -> usize {
        0
    }
}

/// Client layer serving cached rounds and populating the cache on miss.
///
/// `get(0)` bypasses the lookup since "latest" must stay fresh; watch
/// traffic is absorbed into the cache on the way through.
pub struct CachingClient {
    inner: Arc<dyn Client>,
    cache: Arc<dyn Cache>,
}

impl CachingClient {
    /// Wrap `inner` with the given cache.
    pub fn new(inner: Arc<dyn Client>, cache: Arc<dyn Cache>) -> Self {
        Self { inner, cache }
    }
}

impl std::fmt::Debug for CachingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for CachingClient {
    async fn info(&self) -> Result<ChainInfo> {
        self.inner.info().await
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        if round > 0 {
            if let Some(beacon) = self.cache.try_get(round) {
                return Ok(beacon);
            }
        }
        let beacon = self.inner.get(round).await?;
        self.cache.add(beacon.round, &beacon);
        Ok(beacon)
    }

    async fn watch(&self) -> BeaconStream {
        let cache = self.cache.clone();
        self.inner
            .watch()
            .await
            .inspect(move |beacon| cache.add(beacon.round, beacon))
            .boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.inner.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn name(&self) -> String {
        format!("{}+cache", self.inner.name())
    }
}
