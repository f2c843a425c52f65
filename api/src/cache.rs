//! Cache-aside reads over a pluggable key/value store.
//!
//! Values are stored as JSON snapshots. The cache never fails a read: backend
//! errors are logged and treated as a miss, and failed writes or removals are
//! logged and dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::AppError;

/// Deterministic key names.
pub mod keys {
    pub const TAGS: &str = "Blog_Cache_Tags";

    pub fn post(id: i64) -> String {
        format!("Blog_Cache_Posts_{id}")
    }

    pub fn tag(id: i64) -> String {
        format!("Blog_Cache_Tags_{id}")
    }

    pub fn comment(id: i64) -> String {
        format!("Blog_Cache_Comments_{id}")
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

// ── In-memory ──

/// Process-local store with absolute expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone()))
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// ── Redis ──

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(Duration::from_secs(3), client.get_connection_manager())
            .await??;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

// ── Disabled ──

/// Always misses.
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn get_raw(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn set_raw(&self, _key: &str, _value: String, _ttl: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Typed front ──

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl Cache {
    pub fn new(store: impl CacheStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn memory() -> Self {
        Self::new(MemoryCache::new())
    }

    pub fn disabled() -> Self {
        Self::new(NoCache)
    }

    /// In-memory without a URL, Redis when it is reachable, and no caching at
    /// all when a configured Redis cannot be reached.
    pub async fn from_url(redis_url: Option<&str>) -> Self {
        match redis_url {
            None => {
                tracing::info!("no redis url configured, using in-memory cache");
                Self::memory()
            }
            Some(url) => match RedisCache::connect(url).await {
                Ok(store) => {
                    tracing::info!("connected to redis cache");
                    Self::new(store)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "redis unreachable, caching disabled");
                    Self::disabled()
                }
            },
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get_raw(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache value not serialisable");
                return;
            }
        };
        if let Err(e) = self.store.set_raw(key, raw, ttl).await {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            tracing::warn!(key, error = %e, "cache remove failed");
        }
    }

    pub async fn remove_all<I>(&self, keys: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for key in keys {
            self.remove(key.as_ref()).await;
        }
    }

    /// Returns the cached value for `key`, or runs `load`, stores its result
    /// and returns it. Errors from `load` are passed through and not cached.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T, AppError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if let Some(hit) = self.get(key).await {
            tracing::debug!(key, "cache hit");
            return Ok(hit);
        }
        tracing::debug!(key, "cache miss");
        let value = load().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}
