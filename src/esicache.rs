//! Result cache facade
//!
//! Tags with `ttl > 0` cache their fetched payload under the entity
//! fingerprint. Several named caches can be registered per path scope:
//! writes fan out to all of them, reads race them and the first non-empty
//! hit wins. A miss is never an error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{EsiError, Result};

/// One backing cache. Implementations are responsible for their own
/// thread safety and expiry handling.
#[async_trait]
pub trait Cacher: Send + Sync {
    /// Store a value under the key for `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Fetch a value; `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
}

/// Build a cache from a configuration URL: `memory` for the in-process
/// cache, `redis://...` for a Redis-backed one.
pub fn new_cacher(url: &str) -> Result<Arc<dyn Cacher>> {
    if url == "memory" {
        return Ok(Arc::new(MemoryCache::new()));
    }
    match url.split_once("://").map(|(s, _)| s.to_ascii_lowercase()) {
        Some(scheme) if scheme == "redis" => {
            Ok(Arc::new(crate::backend::redis::RedisCache::new(url)?))
        }
        _ => Err(EsiError::NotSupported(format!(
            "no cache backend for URL {:?}",
            url
        ))),
    }
}

struct MemoryEntry {
    data: Bytes,
    expires_at: SystemTime,
}

/// In-process cache with per-entry TTL. Expired entries are dropped
/// lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    storage: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cacher for MemoryCache {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            data: value,
            expires_at: SystemTime::now() + ttl,
        };
        let mut storage = self.storage.write().expect("cache lock poisoned");
        storage.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = SystemTime::now();
        {
            let storage = self.storage.read().expect("cache lock poisoned");
            match storage.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.data.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut storage = self.storage.write().expect("cache lock poisoned");
        storage.remove(key);
        Ok(None)
    }
}

/// Named caches per path scope.
///
/// The scope is the path prefix the host configured (`/`, `/checkout`,
/// ...); each scope can carry several caches, possibly of different
/// backends.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Vec<Arc<dyn Cacher>>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cache to a scope.
    pub fn register(&self, scope: &str, cache: Arc<dyn Cacher>) {
        let mut caches = self.caches.write().expect("cache registry lock poisoned");
        caches.entry(scope.to_owned()).or_default().push(cache);
    }

    /// Attach a cache built from a configuration URL.
    pub fn register_url(&self, scope: &str, url: &str) -> Result<()> {
        let cache = new_cacher(url)?;
        self.register(scope, cache);
        Ok(())
    }

    /// Number of caches registered for the scope.
    pub fn len(&self, scope: &str) -> usize {
        let caches = self.caches.read().expect("cache registry lock poisoned");
        caches.get(scope).map(Vec::len).unwrap_or(0)
    }

    /// Drop every registered cache.
    pub fn clear(&self) {
        let mut caches = self.caches.write().expect("cache registry lock poisoned");
        caches.clear();
    }

    /// Fan a write out to every cache of the scope. Individual cache
    /// errors are logged and swallowed; a broken cache must not fail the
    /// request that tried to fill it.
    pub async fn set(&self, scope: &str, key: &str, value: &Bytes, ttl: Duration) {
        let caches = self.scoped(scope);
        for cache in caches {
            if let Err(e) = cache.set(key, value.clone(), ttl).await {
                debug!(scope, key, error = %e, "cache write failed");
            }
        }
    }

    /// Race every cache of the scope; the first non-empty hit wins.
    /// Returns `None` when no cache holds the key.
    pub async fn get(&self, scope: &str, key: &str) -> Option<Bytes> {
        let caches = self.scoped(scope);
        if caches.is_empty() {
            return None;
        }

        let mut set = JoinSet::new();
        for cache in caches {
            let key = key.to_owned();
            set.spawn(async move { cache.get(&key).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Some(data))) if !data.is_empty() => return Some(data),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(scope, key, error = %e, "cache read failed"),
                Err(e) => debug!(scope, key, error = %e, "cache read task failed"),
            }
        }
        None
    }

    fn scoped(&self, scope: &str) -> Vec<Arc<dyn Cacher>> {
        let caches = self.caches.read().expect("cache registry lock poisoned");
        caches.get(scope).cloned().unwrap_or_default()
    }
}
