//! Test Helper Utilities
//!
//! Shared fixtures for results-ingest integration tests

#![allow(dead_code)]

pub mod fake_feed;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use results_common::config::ServiceConfig;
use results_ingest::db::ResultStore;
use results_ingest::models::{CycleStatus, ViewFilters, ViewKind};
use results_ingest::error::CacheError;
use results_ingest::services::cache::CacheBackend;
use results_ingest::services::{MemoryCache, SchedulerConfig};
use results_ingest::ResultsService;

pub use fake_feed::FakeFeed;

pub const HEADER: &str = "contest,candidate,jurisdiction,votes,percentage,party";

/// CSV body from `(contest, candidate, jurisdiction, votes)` rows
pub fn csv(rows: &[(&str, &str, &str, u64)]) -> String {
    let mut body = String::from(HEADER);
    body.push('\n');
    for (contest, candidate, jurisdiction, votes) in rows {
        body.push_str(&format!(
            "{},{},{},{},0.0,Nonpartisan\n",
            contest, candidate, jurisdiction, votes
        ));
    }
    body
}

/// Running service wired to a fake feed and a throwaway database
pub struct TestService {
    pub service: ResultsService,
    pub feed: FakeFeed,
    pub store: ResultStore,
    pub cache: Arc<MemoryCache>,
    _temp_dir: TempDir,
}

/// Memory cache whose deletes stall, as a slow shared backend would
pub struct SlowDeleteCache {
    inner: Arc<MemoryCache>,
    delay: Duration,
}

#[async_trait]
impl CacheBackend for SlowDeleteCache {
    fn name(&self) -> &'static str {
        "slow-delete"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(keys).await
    }
}

pub struct TestServiceBuilder {
    commit_delay: Option<Duration>,
    cache_delete_delay: Option<Duration>,
    poll_interval: Option<Duration>,
    deadline: Duration,
    configure: Box<dyn FnOnce(&mut ServiceConfig) + Send>,
}

impl TestService {
    pub fn builder() -> TestServiceBuilder {
        TestServiceBuilder {
            commit_delay: None,
            cache_delete_delay: None,
            poll_interval: None,
            deadline: Duration::from_secs(10),
            configure: Box::new(|_| {}),
        }
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    /// Trigger a cycle and wait for it to finish
    pub async fn run_cycle(&self) -> CycleStatus {
        let cycle_id = self.service.trigger_ingestion().await.unwrap();
        self.service
            .wait_for_cycle(cycle_id)
            .await
            .unwrap()
            .expect("cycle known to scheduler")
    }

    pub async fn current_version(&self) -> Option<u64> {
        self.store.current_meta().await.unwrap().map(|m| m.version)
    }

    /// Votes of a candidate in the current contest totals view
    pub async fn votes(&self, contest: &str, candidate: &str) -> Option<u64> {
        self.service
            .get_aggregate(ViewKind::ContestTotals, ViewFilters::all())
            .await
            .unwrap()
            .candidate_votes(contest, candidate)
    }

    pub async fn record_rows(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM result_records")
            .fetch_one(self.store.pool())
            .await
            .unwrap()
    }
}

impl TestServiceBuilder {
    pub fn commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    pub fn cache_delete_delay(mut self, delay: Duration) -> Self {
        self.cache_delete_delay = Some(delay);
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn configure(mut self, configure: impl FnOnce(&mut ServiceConfig) + Send + 'static) -> Self {
        self.configure = Box::new(configure);
        self
    }

    pub async fn start(self) -> TestService {
        let feed = FakeFeed::start().await;
        let temp_dir = TempDir::new().unwrap();

        let mut config = ServiceConfig {
            feed_url: feed.url.clone(),
            database_path: temp_dir.path().join("results.db"),
            ..Default::default()
        };
        config.fetch.max_attempts = 3;
        config.fetch.base_backoff_ms = 1;
        config.fetch.max_backoff_ms = 5;
        config.fetch.request_timeout_secs = 5;
        (self.configure)(&mut config);

        let pool = results_common::db::init_database(&config.database_path)
            .await
            .unwrap();
        let mut store = ResultStore::new(pool);
        if let Some(delay) = self.commit_delay {
            store = store.with_commit_delay(delay);
        }

        let cache = Arc::new(MemoryCache::new());
        let backend: Arc<dyn CacheBackend> = match self.cache_delete_delay {
            Some(delay) => Arc::new(SlowDeleteCache {
                inner: cache.clone(),
                delay,
            }),
            None => cache.clone(),
        };
        let schedule = SchedulerConfig {
            poll_interval: self.poll_interval,
            cycle_deadline: self.deadline,
        };
        let service = ResultsService::start(&config, store.clone(), backend, schedule).unwrap();

        TestService {
            service,
            feed,
            store,
            cache,
            _temp_dir: temp_dir,
        }
    }
}
