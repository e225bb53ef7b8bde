//! One ingestion cycle
//!
//! fetch -> normalize -> reconcile -> commit -> sync cache. Each stage is
//! reported through a callback so the scheduler can track progress. Any
//! error before the commit ends the cycle with nothing committed; the
//! previous version stays current. Cache sync never fails a cycle.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use results_common::events::{CycleState, EventBus, IngestionEvent};

use crate::db::ResultStore;
use crate::error::IngestError;
use crate::models::{affected_view_keys, CycleOutcome, Delta, SnapshotMeta};
use crate::services::cache::CacheSynchronizer;
use crate::services::fetcher::{FeedFetcher, FetchOutcome};
use crate::services::normalizer::Normalizer;
use crate::services::reconciler::{check_freshness, reconcile};

pub struct IngestionPipeline {
    fetcher: FeedFetcher,
    normalizer: Normalizer,
    store: ResultStore,
    cache: Arc<CacheSynchronizer>,
    events: EventBus,
    /// ETag of the last feed body fully processed. Falls back to the
    /// committed snapshot's ETag after a restart.
    last_etag: Mutex<Option<String>>,
}

impl IngestionPipeline {
    pub fn new(
        fetcher: FeedFetcher,
        normalizer: Normalizer,
        store: ResultStore,
        cache: Arc<CacheSynchronizer>,
        events: EventBus,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            store,
            cache,
            events,
            last_etag: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub async fn current_version(&self) -> Result<Option<u64>, IngestError> {
        Ok(self.store.current_meta().await?.map(|m| m.version))
    }

    /// Run one cycle to completion.
    ///
    /// `deadline` bounds everything up to and including the commit; dropping
    /// the in-flight work on expiry rolls back any open transaction. Once the
    /// commit has landed the cycle is `Committed` whatever happens next:
    /// cache sync gets its own budget of `deadline` and is only logged when
    /// it overruns.
    pub async fn run_cycle(
        &self,
        deadline: Duration,
        on_stage: &(dyn Fn(CycleState) + Send + Sync),
    ) -> Result<CycleOutcome, IngestError> {
        let committed = match tokio::time::timeout(deadline, self.fetch_and_commit(on_stage)).await {
            Ok(result) => result?,
            Err(_) => return Err(IngestError::DeadlineExceeded(deadline)),
        };
        let (delta, meta) = match committed {
            Committed::Skipped(outcome) => return Ok(outcome),
            Committed::Version { delta, meta } => (delta, meta),
        };
        *self.last_etag.lock().await = meta.etag.clone();

        on_stage(CycleState::Syncing);
        let keys = affected_view_keys(&delta);
        if tokio::time::timeout(deadline, self.sync_cache(&keys, meta.version))
            .await
            .is_err()
        {
            tracing::warn!(
                version = meta.version,
                keys = keys.len(),
                timeout_ms = deadline.as_millis() as u64,
                "Cache sync timed out; version tags keep readers consistent"
            );
        }

        Ok(CycleOutcome::Committed {
            version: meta.version,
            added: meta.added,
            changed: meta.changed,
            invalidated_keys: keys.len(),
        })
    }

    /// Fetch through Committing
    async fn fetch_and_commit(
        &self,
        on_stage: &(dyn Fn(CycleState) + Send + Sync),
    ) -> Result<Committed, IngestError> {
        on_stage(CycleState::Fetching);
        let committed_meta = self.store.current_meta().await?;
        let current_version = committed_meta.as_ref().map(|m| m.version);
        let etag = {
            let last = self.last_etag.lock().await;
            last.clone()
                .or_else(|| committed_meta.as_ref().and_then(|m| m.etag.clone()))
        };

        let feed = match self.fetcher.fetch(etag.as_deref()).await? {
            FetchOutcome::NotModified => {
                tracing::info!(version = ?current_version, "Feed not modified, nothing to ingest");
                return Ok(Committed::Skipped(CycleOutcome::NotModified { current_version }));
            }
            FetchOutcome::Fetched(feed) => feed,
        };

        on_stage(CycleState::Normalizing);
        let normalized = self.normalizer.normalize(&feed.body)?;

        on_stage(CycleState::Reconciling);
        let previous = self.store.current_snapshot().await?;
        let source_timestamp = feed.source_timestamp();
        check_freshness(previous.as_ref(), source_timestamp)?;
        let delta = reconcile(previous.as_ref(), normalized.records)?;

        if delta.is_empty() {
            let current_version = previous.as_ref().map(|p| p.version());
            tracing::info!(
                version = ?current_version,
                unchanged = delta.unchanged.len(),
                "Feed changed but no record differs, no new version"
            );
            *self.last_etag.lock().await = feed.etag;
            return Ok(Committed::Skipped(CycleOutcome::NoChanges { current_version }));
        }

        on_stage(CycleState::Committing);
        let meta = SnapshotMeta {
            version: previous.as_ref().map_or(1, |p| p.version() + 1),
            source_timestamp,
            etag: feed.etag,
            ingested_at: Utc::now(),
            record_count: previous.as_ref().map_or(0, |p| p.len()) + delta.added.len(),
            added: delta.added.len(),
            changed: delta.changed.len(),
        };
        // nothing may await between a landed commit and returning it
        self.store.commit(&delta, &meta).await?;
        Ok(Committed::Version { delta, meta })
    }

    async fn sync_cache(&self, keys: &BTreeSet<String>, version: u64) {
        let evicted = self.cache.invalidate(keys).await;
        self.events.emit_lossy(IngestionEvent::CacheInvalidated {
            version,
            keys: keys.len(),
            timestamp: Utc::now(),
        });
        let warmed = self.cache.warm_configured().await;
        tracing::debug!(version, keys = keys.len(), evicted, warmed, "Cache synchronized");
    }
}

/// Result of the deadline-bound part of a cycle
enum Committed {
    /// Nothing to commit
    Skipped(CycleOutcome),
    Version { delta: Delta, meta: SnapshotMeta },
}
