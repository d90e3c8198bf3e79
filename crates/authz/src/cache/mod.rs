//! Cache port and the in-process Moka backend.
//!
//! Values are stored as JSON strings so a shared backend can sit behind the
//! same trait; [`get_or_compute`] handles encoding. Cache failures never fail
//! an authorization check: reads fall back to recomputing and writes are
//! logged and dropped.

pub mod keys;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Default maximum number of in-process entries.
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// Narrow cache contract consumed by the authorization services.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value. `None` keeps it until evicted.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key matching `pattern`. A trailing `*` matches any
    /// suffix; otherwise the pattern must equal the key.
    async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, CacheError>;
}

/// Whether `key` matches a removal pattern.
pub fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Return the cached value for `key`, or compute, store and return it.
///
/// Concurrent misses may both run `factory`; the results are identical
/// because factories only read committed state.
pub async fn get_or_compute<T, E, F, Fut>(
    cache: &dyn CacheStore,
    key: &str,
    ttl: Option<Duration>,
    factory: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    E: From<serde_json::Error>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key = %key, "cache hit");
                return Ok(value);
            }
            Err(e) => warn!(key = %key, error = %e, "discarding undecodable cache entry"),
        },
        Ok(None) => debug!(key = %key, "cache miss"),
        Err(e) => warn!(key = %key, error = %e, "cache read failed, recomputing"),
    }

    let value = factory().await?;
    let raw = serde_json::to_string(&value)?;

    if let Err(e) = cache.set(key, raw, ttl).await {
        warn!(key = %key, error = %e, "failed to store computed value in cache");
    }

    Ok(value)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    ttl: Option<Duration>,
}

/// Per-entry expiration taken from the TTL passed to `set`.
struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process cache backed by Moka.
#[derive(Clone)]
pub struct MokaCacheStore {
    inner: Arc<Cache<String, CacheEntry>>,
}

impl MokaCacheStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryTtl)
            .build();

        Self {
            inner: Arc::new(cache),
        }
    }

    /// Whether `key` currently holds a live value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }
}

impl Default for MokaCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

#[async_trait]
impl CacheStore for MokaCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner
            .insert(key.to_string(), CacheEntry { value, ttl })
            .await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key).await;
        debug!(key = %key, "cache invalidated");
        Ok(())
    }

    async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        if pattern.is_empty() {
            return Err(CacheError::InvalidPattern(pattern.to_string()));
        }

        let keys: Vec<Arc<String>> = self
            .inner
            .iter()
            .filter(|(key, _)| matches_pattern(key, pattern))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.inner.invalidate(key.as_str()).await;
        }

        debug!(pattern = %pattern, keys_invalidated = keys.len(), "cache pattern invalidated");
        Ok(keys.len() as u64)
    }
}

impl std::fmt::Debug for MokaCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaCacheStore").finish()
    }
}
