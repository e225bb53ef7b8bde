//! Read path
//!
//! Cache-first aggregate reads. The current version is resolved before
//! anything else and every store read is pinned to it, so a reader sees one
//! committed version in full or not at all.

use std::sync::Arc;
use std::time::Duration;

use crate::db::ResultStore;
use crate::error::QueryError;
use crate::models::{view_key, AggregateView, SnapshotMeta, ViewFilters, ViewKind};
use crate::services::cache::CacheSynchronizer;

pub struct QueryService {
    store: ResultStore,
    cache: Arc<CacheSynchronizer>,
    read_timeout: Duration,
}

impl QueryService {
    pub fn new(store: ResultStore, cache: Arc<CacheSynchronizer>, read_timeout: Duration) -> Self {
        Self {
            store,
            cache,
            read_timeout,
        }
    }

    /// Aggregate view at the current version
    pub async fn get_view(
        &self,
        kind: ViewKind,
        filters: ViewFilters,
    ) -> Result<AggregateView, QueryError> {
        let filters = filters.normalized();
        tokio::time::timeout(self.read_timeout, self.read_current(kind, &filters))
            .await
            .map_err(|_| {
                tracing::warn!(view = %kind, timeout_ms = self.read_timeout.as_millis() as u64, "Read timed out");
                QueryError::Timeout(self.read_timeout)
            })?
    }

    /// Aggregate view at a historical committed version (never cached)
    pub async fn get_view_at(
        &self,
        version: u64,
        kind: ViewKind,
        filters: ViewFilters,
    ) -> Result<AggregateView, QueryError> {
        let filters = filters.normalized();
        tokio::time::timeout(self.read_timeout, async {
            let meta = self
                .store
                .meta_at(version)
                .await?
                .ok_or(QueryError::UnknownVersion(version))?;
            let records = self.store.load_records(meta.version, &filters).await?;
            Ok::<_, QueryError>(AggregateView::build(kind, &filters, Some(&meta), &records))
        })
        .await
        .map_err(|_| QueryError::Timeout(self.read_timeout))?
    }

    async fn read_current(
        &self,
        kind: ViewKind,
        filters: &ViewFilters,
    ) -> Result<AggregateView, QueryError> {
        let Some(meta) = self.store.current_meta().await? else {
            return Ok(AggregateView::build(kind, filters, None, &[]));
        };

        let key = view_key(kind, filters);
        if let Some(entry) = self.cache.get(&key).await {
            if entry.version == meta.version {
                tracing::trace!(%key, version = meta.version, "Cache hit");
                return Ok(entry.view);
            }
            if entry.version < meta.version
                && !self
                    .store
                    .changed_since(filters, entry.version, meta.version)
                    .await?
            {
                tracing::debug!(
                    %key,
                    from = entry.version,
                    to = meta.version,
                    "Cached view unaffected by newer versions, re-tagging"
                );
                let view = retag(entry.view, &meta);
                self.cache.put(&key, &view).await;
                return Ok(view);
            }
            tracing::debug!(%key, cached = entry.version, current = meta.version, "Stale cache entry");
        }

        let records = self.store.load_records(meta.version, filters).await?;
        let view = AggregateView::build(kind, filters, Some(&meta), &records);
        self.cache.put(&key, &view).await;
        Ok(view)
    }
}

fn retag(mut view: AggregateView, meta: &SnapshotMeta) -> AggregateView {
    view.version = meta.version;
    view.source_timestamp = Some(meta.source_timestamp);
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangedRecord, Delta, RecordKey, ResultRecord};
    use crate::services::cache::MemoryCache;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: ResultStore,
        cache: Arc<CacheSynchronizer>,
        query: QueryService,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = results_common::db::init_database(&dir.path().join("results.db"))
            .await
            .unwrap();
        let store = ResultStore::new(pool);
        let cache = Arc::new(CacheSynchronizer::new(
            Arc::new(MemoryCache::new()),
            store.clone(),
            Duration::from_secs(60),
            vec![],
        ));
        let query = QueryService::new(store.clone(), cache.clone(), Duration::from_secs(2));
        Fixture {
            _dir: dir,
            store,
            cache,
            query,
        }
    }

    fn meta(version: u64) -> crate::models::SnapshotMeta {
        crate::models::SnapshotMeta {
            version,
            source_timestamp: Utc::now(),
            etag: None,
            ingested_at: Utc::now(),
            record_count: 0,
            added: 0,
            changed: 0,
        }
    }

    fn record(contest: &str, candidate: &str, votes: u64) -> ResultRecord {
        ResultRecord::new(RecordKey::new(contest, candidate, "1"), votes, 0.0)
    }

    #[tokio::test]
    async fn test_empty_store_serves_version_zero() {
        let f = fixture().await;
        let view = f
            .query
            .get_view(ViewKind::ContestTotals, ViewFilters::all())
            .await
            .unwrap();
        assert_eq!(view.version, 0);
        assert_eq!(view.contests(), Some(&[][..]));
    }

    #[tokio::test]
    async fn test_stale_entry_recomputed_after_commit() {
        let f = fixture().await;
        let v1 = Delta {
            added: vec![record("Mayor", "A", 100)],
            ..Default::default()
        };
        f.store.commit(&v1, &meta(1)).await.unwrap();

        let first = f.query.get_view(ViewKind::ContestTotals, ViewFilters::all()).await.unwrap();
        assert_eq!(first.candidate_votes("Mayor", "A"), Some(100));

        // commit without invalidating: version tag must still catch it
        let v2 = Delta {
            changed: vec![ChangedRecord {
                previous_votes: 100,
                record: record("Mayor", "A", 150),
            }],
            ..Default::default()
        };
        f.store.commit(&v2, &meta(2)).await.unwrap();

        let second = f.query.get_view(ViewKind::ContestTotals, ViewFilters::all()).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.candidate_votes("Mayor", "A"), Some(150));
    }

    #[tokio::test]
    async fn test_unaffected_entry_is_retagged() {
        let f = fixture().await;
        let v1 = Delta {
            added: vec![record("Mayor", "A", 100), record("Council", "C", 10)],
            ..Default::default()
        };
        f.store.commit(&v1, &meta(1)).await.unwrap();

        let council = ViewFilters::contest("Council");
        let first = f.query.get_view(ViewKind::ContestTotals, council.clone()).await.unwrap();
        assert_eq!(first.version, 1);

        let v2 = Delta {
            changed: vec![ChangedRecord {
                previous_votes: 100,
                record: record("Mayor", "A", 120),
            }],
            ..Default::default()
        };
        f.store.commit(&v2, &meta(2)).await.unwrap();

        let second = f.query.get_view(ViewKind::ContestTotals, council.clone()).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.candidate_votes("Council", "C"), Some(10));

        let entry = f
            .cache
            .get(&view_key(ViewKind::ContestTotals, &council))
            .await
            .unwrap();
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_historical_reads() {
        let f = fixture().await;
        let v1 = Delta {
            added: vec![record("Mayor", "A", 100)],
            ..Default::default()
        };
        f.store.commit(&v1, &meta(1)).await.unwrap();
        let v2 = Delta {
            changed: vec![ChangedRecord {
                previous_votes: 100,
                record: record("Mayor", "A", 150),
            }],
            ..Default::default()
        };
        f.store.commit(&v2, &meta(2)).await.unwrap();

        let old = f
            .query
            .get_view_at(1, ViewKind::ContestTotals, ViewFilters::all())
            .await
            .unwrap();
        assert_eq!(old.version, 1);
        assert_eq!(old.candidate_votes("Mayor", "A"), Some(100));

        assert!(matches!(
            f.query
                .get_view_at(9, ViewKind::ContestTotals, ViewFilters::all())
                .await,
            Err(QueryError::UnknownVersion(9))
        ));
    }
}
