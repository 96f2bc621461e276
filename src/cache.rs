//! Shared low-latency cache and the two-tier lookup built on it.
//!
//! [`SharedCache`] is the narrow interface the gateway needs: string get/set
//! with a TTL, and one atomic sliding-window step for rate limiting.
//! [`MemoryCache`] serves a single process (and tests); [`RedisCache`] is shared
//! across gateway replicas.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// One atomic sliding-window step: drop entries older than `window`, count
    /// what is left, record `member` at `now_ms`, and refresh the key's TTL.
    ///
    /// Returns the count *before* the new entry was added.
    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<u64, CacheError>;
}

// ---------------------------------------------------------------------------
// In-process cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Window {
    hits: VecDeque<u64>,
    expires_at: Instant,
}

/// How often expired keys are swept out of a [`MemoryCache`].
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    windows: DashMap<String, Window>,
    next_sweep: Mutex<Instant>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            windows: DashMap::new(),
            next_sweep: Mutex::new(Instant::now() + SWEEP_INTERVAL),
        }
    }

    /// Drop every expired entry and window, at most once per [`SWEEP_INTERVAL`].
    /// Must not be called while holding a guard into either map.
    fn sweep_expired(&self, now: Instant) {
        // A concurrent caller is already sweeping, or the lock is poisoned.
        let Ok(mut next) = self.next_sweep.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        *next = now + SWEEP_INTERVAL;
        drop(next);

        self.entries.retain(|_, e| e.expires_at > now);
        self.windows.retain(|_, w| w.expires_at > now);
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        self.sweep_expired(now);
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        self.sweep_expired(now);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
        _member: &str,
    ) -> Result<u64, CacheError> {
        let now = Instant::now();
        self.sweep_expired(now);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);

        // The shard lock held by `entry` makes the whole step atomic per key.
        let mut slot = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            hits: VecDeque::new(),
            expires_at: now + window,
        });
        if slot.expires_at <= now {
            slot.hits.clear();
        }
        while slot.hits.front().is_some_and(|ts| *ts <= cutoff) {
            slot.hits.pop_front();
        }
        let count = slot.hits.len() as u64;
        slot.hits.push_back(now_ms);
        slot.expires_at = now + window;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RedisCache {
    client: redis::Client,
    prefix: String,
}

impl RedisCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "llm-gateway".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms.max(1))
            .ignore();

        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Two-tier lookup
// ---------------------------------------------------------------------------

/// Cache-then-store lookup for one kind of value.
///
/// Hits are served from the cache for up to `ttl`; misses go to the loader and
/// repopulate the cache. Entries are never invalidated early, so a value may be
/// up to `ttl` stale. A cache failure falls through to the loader.
pub struct ReadThrough<T> {
    cache: Arc<dyn SharedCache>,
    namespace: &'static str,
    ttl: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ReadThrough<T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            namespace: self.namespace,
            ttl: self.ttl,
            _marker: PhantomData,
        }
    }
}

impl<T> ReadThrough<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(cache: Arc<dyn SharedCache>, namespace: &'static str, ttl: Duration) -> Self {
        Self {
            cache,
            namespace,
            ttl,
            _marker: PhantomData,
        }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let cache_key = self.cache_key(key);

        match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => tracing::warn!(key = %cache_key, error = %e, "discarding undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %cache_key, error = %e, "cache read failed, using store"),
        }

        let loaded = load().await?;

        if let Some(ref value) = loaded {
            match serde_json::to_string(value) {
                Ok(raw) => {
                    if let Err(e) = self.cache.set_ex(&cache_key, &raw, self.ttl).await {
                        tracing::warn!(key = %cache_key, error = %e, "cache write failed");
                    }
                }
                Err(e) => tracing::warn!(key = %cache_key, error = %e, "value not cacheable"),
            }
        }

        Ok(loaded)
    }
}
