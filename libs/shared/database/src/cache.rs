use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

/// Entry bound used by `QueryCache::new`.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Cache key: a collection name followed by the read's parameters, e.g.
/// `visits / 2026-10-17 / *`. Invalidation matches keys by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    collection: String,
    params: Vec<String>,
}

impl CacheKey {
    pub fn new(collection: impl Into<String>) -> Self {
        Self { collection: collection.into(), params: Vec::new() }
    }

    pub fn param(mut self, param: impl ToString) -> Self {
        self.params.push(param.to_string());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
        self.collection == other.collection
            && self.params.len() <= other.params.len()
            && self.params.iter().zip(&other.params).all(|(a, b)| a == b)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection)?;
        for param in &self.params {
            write!(f, "/{}", param)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub fetches: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
struct CacheEntry {
    value: Option<Value>,
    stale: bool,
    // Bumped by every invalidation; a fetch that saw an older generation
    // stores its result as stale.
    generation: u64,
    fetched_at: Option<DateTime<Utc>>,
    // Store order, oldest first when evicting.
    stored: u64,
}

impl CacheEntry {
    fn empty() -> Self {
        Self { value: None, stale: true, generation: 0, fetched_at: None, stored: 0 }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    fetches: AtomicU64,
    invalidations: AtomicU64,
    stores: AtomicU64,
}

/// Process-local read cache shared by every consumer in the process.
/// The lock is never held while a fetch is running. Once `capacity` keys are
/// held, adding a key evicts one: stale entries first, then the oldest fetch.
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the cached value for `key`, or runs `fetch` when the key is
    /// missing or stale and stores its result.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<serde_json::Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get(key) {
                if let (false, Some(value)) = (entry.stale, &entry.value) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit for {}", key);
                    return Ok(serde_json::from_value(value.clone())?);
                }
            }
            self.entry_mut(&mut entries, key).generation
        };

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for {}, fetching", key);
        let fetched = match fetch().await {
            Ok(fresh) => serde_json::to_value(&fresh).map(|value| (fresh, value)).map_err(E::from),
            Err(e) => Err(e),
        };
        let (fresh, value) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                self.discard_placeholder(key, generation).await;
                return Err(e);
            }
        };

        let mut entries = self.entries.write().await;
        let entry = self.entry_mut(&mut entries, key);
        entry.stale = entry.generation != generation;
        entry.value = Some(value);
        entry.fetched_at = Some(Utc::now());
        entry.stored = self.counters.stores.fetch_add(1, Ordering::Relaxed) + 1;
        if entry.stale {
            debug!("{} was invalidated during fetch, keeping it stale", key);
        }

        Ok(fresh)
    }

    fn entry_mut<'a>(
        &self,
        entries: &'a mut HashMap<CacheKey, CacheEntry>,
        key: &CacheKey,
    ) -> &'a mut CacheEntry {
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| (e.value.is_some() && !e.stale, e.stored))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                debug!("Cache full, evicted {}", victim);
            }
        }
        entries.entry(key.clone()).or_insert_with(CacheEntry::empty)
    }

    // A failed first fetch leaves nothing behind unless an invalidation
    // arrived meanwhile; that entry must keep its generation for any
    // concurrent fetch of the same key.
    async fn discard_placeholder(&self, key: &CacheKey, generation: u64) {
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|e| e.value.is_none() && e.generation == generation)
        {
            entries.remove(key);
        }
    }

    /// Marks every entry under `prefix` stale. Returns how many entries went
    /// from fresh to stale; repeating an invalidation is a no-op.
    pub async fn invalidate(&self, prefix: &CacheKey) -> usize {
        let mut entries = self.entries.write().await;
        let mut newly_stale = 0;
        for (key, entry) in entries.iter_mut() {
            if prefix.is_prefix_of(key) {
                if !entry.stale {
                    newly_stale += 1;
                }
                entry.stale = true;
                entry.generation += 1;
            }
        }
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("Invalidated {} ({} entries newly stale)", prefix, newly_stale);
        newly_stale
    }

    /// `Some(true)` when the key holds a value that must be refetched.
    pub async fn is_stale(&self, key: &CacheKey) -> Option<bool> {
        let entries = self.entries.read().await;
        entries.get(key).filter(|e| e.value.is_some()).map(|e| e.stale)
    }

    pub async fn fetched_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|e| e.fetched_at)
    }

    /// Drops every entry whose key matches `predicate`. Returns how many went.
    pub async fn evict_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} cache entries", evicted);
        }
        evicted
    }

    /// Keys held, including placeholders of fetches still running.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.values().filter(|e| e.value.is_some()).count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}
