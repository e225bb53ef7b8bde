//! Ingestion and read-path services

pub mod cache;
pub mod fetcher;
pub mod normalizer;
pub mod pipeline;
pub mod query;
pub mod reconciler;
pub mod scheduler;

pub use cache::{CacheBackend, CacheEntry, CacheSynchronizer, MemoryCache, NoCache};
#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use fetcher::{FeedBody, FeedFetcher, FetchOutcome};
pub use normalizer::{NormalizedFeed, Normalizer, SkippedRow, SkippedRows};
pub use pipeline::IngestionPipeline;
pub use query::QueryService;
pub use reconciler::{check_freshness, reconcile};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
