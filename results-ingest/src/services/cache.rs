//! Aggregate view cache
//!
//! The cache is advisory. Every entry carries the snapshot version it was
//! computed against and readers compare it with the store's current
//! version, so losing entries, failing to delete them, or a backend outage
//! only costs recomputation. TTL bounds memory, not staleness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::db::ResultStore;
use crate::error::{CacheError, QueryError};
use crate::models::{AggregateView, ViewFilters, ViewKind};

/// Key/value store with per-key expiry
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Delete `keys`, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError>;
}

/// Stored entries (live or expired) at which `set` sweeps expired ones
const DEFAULT_SWEEP_THRESHOLD: usize = 256;

/// Process-local cache backend
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    sweep_threshold: usize,
    /// Size that triggers the next sweep; twice the live set left by the
    /// previous sweep, never below `sweep_threshold`
    next_sweep: AtomicUsize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
            next_sweep: AtomicUsize::new(DEFAULT_SWEEP_THRESHOLD),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold.max(1);
        self.next_sweep = AtomicUsize::new(self.sweep_threshold);
        self
    }

    /// Entries held in memory, including expired ones not yet swept
    pub async fn stored_entries(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => {
                    return Ok(Some(value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // expired
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.len() >= self.next_sweep.load(Ordering::Relaxed) {
            let before = entries.len();
            entries.retain(|_, (_, expires_at)| *expires_at > now);
            let next = (entries.len() * 2).max(self.sweep_threshold);
            self.next_sweep.store(next, Ordering::Relaxed);
            tracing::trace!(swept = before - entries.len(), next, "Expired cache entries swept");
        }
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }
}

/// Caching disabled; every read is a miss
pub struct NoCache;

#[async_trait]
impl CacheBackend for NoCache {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _keys: &[String]) -> Result<usize, CacheError> {
        Ok(0)
    }
}

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisCache;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use redis::aio::MultiplexedConnection;

    /// Shared cache backend for multi-instance deployments
    pub struct RedisCache {
        connection: MultiplexedConnection,
    }

    impl RedisCache {
        pub async fn connect(url: &str) -> Result<Self, CacheError> {
            let client = redis::Client::open(url).map_err(backend_error)?;
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(backend_error)?;
            tracing::info!(url, "Connected to Redis cache");
            Ok(Self { connection })
        }
    }

    fn backend_error(err: redis::RedisError) -> CacheError {
        CacheError::Backend(err.to_string())
    }

    #[async_trait]
    impl CacheBackend for RedisCache {
        fn name(&self) -> &'static str {
            "redis"
        }

        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            let mut conn = self.connection.clone();
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .map_err(backend_error)
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
            let mut conn = self.connection.clone();
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(backend_error)
        }

        async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.connection.clone();
            redis::cmd("DEL")
                .arg(keys.to_vec())
                .query_async::<_, usize>(&mut conn)
                .await
                .map_err(backend_error)
        }
    }
}

/// Cached view tagged with its snapshot version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u64,
    pub cached_at: DateTime<Utc>,
    pub view: AggregateView,
}

/// Keeps the cache in step with committed versions
pub struct CacheSynchronizer {
    backend: Arc<dyn CacheBackend>,
    store: ResultStore,
    ttl: Duration,
    warm_views: Vec<ViewKind>,
}

impl CacheSynchronizer {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        store: ResultStore,
        ttl: Duration,
        warm_views: Vec<ViewKind>,
    ) -> Self {
        Self {
            backend,
            store,
            ttl,
            warm_views,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Cached entry for `key`; backend and decode errors count as a miss
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, backend = self.backend.name(), error = %e, "Cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key, error = %e, "Undecodable cache entry, ignoring");
                None
            }
        }
    }

    /// Store `view` under `key`, tagged with the view's version
    pub async fn put(&self, key: &str, view: &AggregateView) {
        let entry = CacheEntry {
            version: view.version,
            cached_at: Utc::now(),
            view: view.clone(),
        };
        let result = match serde_json::to_string(&entry) {
            Ok(raw) => self.backend.set(key, raw, self.ttl).await,
            Err(e) => Err(CacheError::from(e)),
        };
        if let Err(e) = result {
            tracing::warn!(key, backend = self.backend.name(), error = %e, "Cache write failed");
        }
    }

    /// Evict `keys`. Returns how many were evicted (0 on backend failure).
    pub async fn invalidate(&self, keys: &BTreeSet<String>) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let keys: Vec<String> = keys.iter().cloned().collect();
        match self.backend.delete(&keys).await {
            Ok(deleted) => {
                tracing::debug!(requested = keys.len(), deleted, "Cache keys invalidated");
                deleted
            }
            Err(e) => {
                tracing::warn!(
                    requested = keys.len(),
                    backend = self.backend.name(),
                    error = %e,
                    "Cache invalidation failed; version tags keep readers consistent"
                );
                0
            }
        }
    }

    /// Compute a view at the current version and cache it
    pub async fn warm(
        &self,
        kind: ViewKind,
        filters: &ViewFilters,
    ) -> Result<AggregateView, QueryError> {
        let meta = self.store.current_meta().await?;
        let records = match &meta {
            Some(meta) => self.store.load_records(meta.version, filters).await?,
            None => Vec::new(),
        };
        let view = AggregateView::build(kind, filters, meta.as_ref(), &records);
        self.put(&view.cache_key(), &view).await;
        Ok(view)
    }

    /// Recompute the configured warm views concurrently
    pub async fn warm_configured(&self) -> usize {
        if self.warm_views.is_empty() {
            return 0;
        }
        let filters = ViewFilters::all();
        let results = join_all(self.warm_views.iter().map(|kind| self.warm(*kind, &filters))).await;

        let mut warmed = 0;
        for (kind, result) in self.warm_views.iter().zip(results) {
            match result {
                Ok(_) => warmed += 1,
                Err(e) => tracing::warn!(view = %kind, error = %e, "Cache warm failed"),
            }
        }
        warmed
    }
}

/// Parse configured warm view names
pub fn parse_warm_views(names: &[String]) -> Result<Vec<ViewKind>, String> {
    names.iter().map(|name| name.trim().parse()).collect()
}
