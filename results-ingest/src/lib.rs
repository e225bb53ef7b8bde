//! results-ingest library
//!
//! Polls the published results feed, commits each changed snapshot as a new
//! version in SQLite and serves cached aggregate views that always match
//! one committed version.

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use results_common::config::{CacheBackendKind, CacheConfig, ServiceConfig};
use results_common::events::{EventBus, IngestionEvent};
use results_common::Error;

use crate::db::ResultStore;
use crate::error::{QueryError, SchedulerError};
use crate::models::{AggregateView, CycleId, CycleStatus, SnapshotMeta, ViewFilters, ViewKind};
use crate::services::cache::{parse_warm_views, CacheBackend, CacheSynchronizer, MemoryCache, NoCache};
use crate::services::{FeedFetcher, IngestionPipeline, Normalizer, QueryService, Scheduler, SchedulerConfig, SchedulerHandle};

/// Results service: ingestion scheduler plus the read API
pub struct ResultsService {
    store: ResultStore,
    query: QueryService,
    cache: Arc<CacheSynchronizer>,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    events: EventBus,
}

impl ResultsService {
    /// Wire the components together and spawn the scheduler
    pub fn start(
        config: &ServiceConfig,
        store: ResultStore,
        backend: Arc<dyn CacheBackend>,
        schedule: SchedulerConfig,
    ) -> results_common::Result<Self> {
        let warm_views = parse_warm_views(&config.cache.warm_views).map_err(Error::Config)?;
        let events = EventBus::new(config.events_capacity);

        let cache = Arc::new(CacheSynchronizer::new(
            backend,
            store.clone(),
            Duration::from_secs(config.cache.ttl_secs),
            warm_views,
        ));
        let query = QueryService::new(
            store.clone(),
            Arc::clone(&cache),
            Duration::from_millis(config.read_timeout_ms),
        );

        let pipeline = Arc::new(IngestionPipeline::new(
            FeedFetcher::new(config.feed_url.clone(), &config.fetch)?,
            Normalizer::new(&config.normalize),
            store.clone(),
            Arc::clone(&cache),
            events.clone(),
        ));
        let (scheduler, scheduler_task) = Scheduler::spawn(pipeline, events.clone(), schedule);

        tracing::info!(
            feed_url = %config.feed_url,
            cache = cache.backend_name(),
            "Results service started"
        );

        Ok(Self {
            store,
            query,
            cache,
            scheduler,
            scheduler_task,
            events,
        })
    }

    /// Aggregate view at the current committed version
    pub async fn get_aggregate(
        &self,
        kind: ViewKind,
        filters: ViewFilters,
    ) -> Result<AggregateView, QueryError> {
        self.query.get_view(kind, filters).await
    }

    /// Aggregate view at a historical committed version
    pub async fn get_aggregate_at(
        &self,
        version: u64,
        kind: ViewKind,
        filters: ViewFilters,
    ) -> Result<AggregateView, QueryError> {
        self.query.get_view_at(version, kind, filters).await
    }

    /// Start an ingestion cycle now, or join the running one
    pub async fn trigger_ingestion(&self) -> Result<CycleId, SchedulerError> {
        self.scheduler.trigger().await
    }

    /// Status of a cycle, from the scheduler or the persisted history
    pub async fn ingestion_status(
        &self,
        cycle_id: CycleId,
    ) -> Result<Option<CycleStatus>, QueryError> {
        if let Ok(Some(status)) = self.scheduler.status(cycle_id).await {
            return Ok(Some(status));
        }
        Ok(db::cycles::load_cycle(self.store.pool(), cycle_id).await?)
    }

    /// Block until a cycle finishes
    pub async fn wait_for_cycle(
        &self,
        cycle_id: CycleId,
    ) -> Result<Option<CycleStatus>, SchedulerError> {
        self.scheduler.wait(cycle_id).await
    }

    /// Committed versions, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<SnapshotMeta>, QueryError> {
        Ok(self.store.history(limit).await?)
    }

    /// Receive ingestion events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<IngestionEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &CacheSynchronizer {
        &self.cache
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Stop the scheduler, aborting any running cycle
    pub async fn shutdown(self) {
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::debug!(error = %e, "Scheduler already stopped");
        }
        if let Err(e) = self.scheduler_task.await {
            tracing::warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

/// Cache backend selected by configuration
pub async fn build_cache_backend(config: &CacheConfig) -> results_common::Result<Arc<dyn CacheBackend>> {
    match config.backend {
        CacheBackendKind::Memory => Ok(Arc::new(MemoryCache::new())),
        CacheBackendKind::None => Ok(Arc::new(NoCache)),
        CacheBackendKind::Redis => redis_backend(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_backend(config: &CacheConfig) -> results_common::Result<Arc<dyn CacheBackend>> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| Error::Config("cache.redis_url is not set".to_string()))?;
    let cache = services::cache::RedisCache::connect(url)
        .await
        .map_err(|e| Error::Config(e.to_string()))?;
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
async fn redis_backend(_config: &CacheConfig) -> results_common::Result<Arc<dyn CacheBackend>> {
    Err(Error::Config(
        "cache.backend = \"redis\" requires building with the `redis` feature".to_string(),
    ))
}
