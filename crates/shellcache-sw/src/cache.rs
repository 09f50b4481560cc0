//! Cache storage: named buckets of request → response snapshots.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache (one per bucket name)
//!             └── RequestKey → CacheEntry
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use shellcache_net::{RequestKey, Response};
use tokio::sync::RwLock;
use tracing::trace;

use crate::ServiceWorkerError;

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request identity.
    pub key: RequestKey,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(key: RequestKey, response: Response) -> Self {
        Self {
            key,
            response,
            cached_at: now_millis(),
        }
    }
}

/// One bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Bucket name.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create an empty bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up an entry.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store a response, replacing any entry under the same key.
    pub fn put(&mut self, key: RequestKey, response: Response) {
        let entry = CacheEntry::new(key.clone(), response);
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bucket-addressed response store.
///
/// Every call is a suspension point; implementations provide per-call
/// atomicity only.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the bucket if absent. An existing bucket keeps its entries.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// Whether a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// All bucket names.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a bucket. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Look up `key` in bucket `name`. A missing bucket is a miss.
    async fn match_in(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<Response>, ServiceWorkerError>;

    /// Store `response` under `key` in an opened bucket.
    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: Response,
    ) -> Result<(), ServiceWorkerError>;
}

/// In-process [`CacheStorage`].
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a bucket, if it exists.
    pub async fn len_of(&self, name: &str) -> Option<usize> {
        self.caches.read().await.get(name).map(Cache::len)
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn match_in(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        let hit = caches
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .map(|entry| entry.response.clone());
        trace!(cache = name, key = %key, hit = hit.is_some(), "Cache lookup");
        Ok(hit)
    }

    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: Response,
    ) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .get_mut(name)
            .ok_or_else(|| ServiceWorkerError::CacheError(format!("cache {name} is not open")))?;
        cache.put(key, response);
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
