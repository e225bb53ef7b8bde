//! Versioned result store
//!
//! `result_records` is append-only: a record's state at version V is its
//! row with the highest version <= V. Readers pin a version first and only
//! ever see rows at or below it, so a commit in flight is invisible to them
//! until `snapshot_metadata` holds its row.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::IngestError;
use crate::models::{
    Delta, IngestionSnapshot, PartyPreference, RecordKey, ResultRecord, SnapshotMeta, ViewFilters,
};
use results_common::{Error, Result};

/// Latest row per identity at or below a version
const RECORDS_AT_VERSION: &str = r#"
    SELECT r.contest, r.candidate, r.jurisdiction, r.votes, r.percentage, r.party
    FROM result_records r
    JOIN (
        SELECT contest, candidate, jurisdiction, MAX(version) AS version
        FROM result_records
        WHERE version <= ?1
        GROUP BY contest, candidate, jurisdiction
    ) latest
    ON r.contest = latest.contest
       AND r.candidate = latest.candidate
       AND r.jurisdiction = latest.jurisdiction
       AND r.version = latest.version
    WHERE (?2 IS NULL OR r.contest = ?2)
      AND (?3 IS NULL OR r.jurisdiction = ?3)
    ORDER BY r.contest, r.jurisdiction, r.candidate
"#;

const META_COLUMNS: &str =
    "version, source_timestamp, etag, ingested_at, record_count, added_count, changed_count";

/// Durable store of committed snapshots
#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
    /// Pause inside the open commit transaction (diagnostics and tests)
    commit_delay: Option<Duration>,
}

impl ResultStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            commit_delay: None,
        }
    }

    /// Hold every commit transaction open for `delay` before committing
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Metadata of the current (highest committed) version
    pub async fn current_meta(&self) -> Result<Option<SnapshotMeta>> {
        let sql = format!(
            "SELECT {} FROM snapshot_metadata ORDER BY version DESC LIMIT 1",
            META_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.map(|r| meta_from_row(&r)).transpose()
    }

    /// Metadata of a specific committed version
    pub async fn meta_at(&self, version: u64) -> Result<Option<SnapshotMeta>> {
        let sql = format!(
            "SELECT {} FROM snapshot_metadata WHERE version = ?",
            META_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| meta_from_row(&r)).transpose()
    }

    /// Committed versions, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<SnapshotMeta>> {
        let sql = format!(
            "SELECT {} FROM snapshot_metadata ORDER BY version DESC LIMIT ?",
            META_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(meta_from_row).collect()
    }

    /// Records as of `version`, restricted by `filters`
    pub async fn load_records(
        &self,
        version: u64,
        filters: &ViewFilters,
    ) -> Result<Vec<ResultRecord>> {
        let rows = sqlx::query(RECORDS_AT_VERSION)
            .bind(version as i64)
            .bind(filters.contest.as_deref())
            .bind(filters.jurisdiction.as_deref())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// The full current snapshot, or `None` before the first commit
    pub async fn current_snapshot(&self) -> Result<Option<IngestionSnapshot>> {
        let Some(meta) = self.current_meta().await? else {
            return Ok(None);
        };
        let records = self.load_records(meta.version, &ViewFilters::all()).await?;

        Ok(Some(IngestionSnapshot {
            records: records
                .into_iter()
                .map(|r| (r.key.clone(), r))
                .collect::<HashMap<_, _>>(),
            meta,
        }))
    }

    /// True if any record matching `filters` was written in `(from, to]`
    pub async fn changed_since(&self, filters: &ViewFilters, from: u64, to: u64) -> Result<bool> {
        if to <= from {
            return Ok(false);
        }
        let changed: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM result_records
                WHERE version > ?1 AND version <= ?2
                  AND (?3 IS NULL OR contest = ?3)
                  AND (?4 IS NULL OR jurisdiction = ?4)
            )
            "#,
        )
        .bind(from as i64)
        .bind(to as i64)
        .bind(filters.contest.as_deref())
        .bind(filters.jurisdiction.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(changed != 0)
    }

    /// Apply `delta` as version `meta.version` in a single transaction.
    ///
    /// Fails with `StaleVersion` if the store already holds that version or a
    /// later one. Dropping the returned future before it resolves rolls the
    /// transaction back.
    pub async fn commit(
        &self,
        delta: &Delta,
        meta: &SnapshotMeta,
    ) -> std::result::Result<(), IngestError> {
        let mut tx = self.pool.begin().await?;

        // metadata first: the write takes the database write lock, so the
        // version check below cannot race another committer
        let inserted = sqlx::query(
            r#"
            INSERT INTO snapshot_metadata (
                version, source_timestamp, etag, ingested_at,
                record_count, added_count, changed_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(meta.version as i64)
        .bind(meta.source_timestamp.to_rfc3339())
        .bind(meta.etag.as_deref())
        .bind(meta.ingested_at.to_rfc3339())
        .bind(meta.record_count as i64)
        .bind(meta.added as i64)
        .bind(meta.changed as i64)
        .execute(&mut *tx)
        .await;

        let duplicate = match inserted {
            Ok(_) => false,
            Err(e) if is_unique_violation(&e) => true,
            Err(e) => return Err(e.into()),
        };

        let highest_other: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM snapshot_metadata WHERE version != ?")
                .bind(meta.version as i64)
                .fetch_one(&mut *tx)
                .await?;
        let current = highest_other.unwrap_or(0) as u64;

        if duplicate || current >= meta.version {
            let current = if duplicate { current.max(meta.version) } else { current };
            tracing::warn!(
                attempted = meta.version,
                current,
                "Commit lost to an equal or higher version, aborting"
            );
            return Err(IngestError::StaleVersion {
                attempted: meta.version,
                current,
            });
        }

        for record in delta.records_to_write() {
            sqlx::query(
                r#"
                INSERT INTO result_records (
                    contest, candidate, jurisdiction, version, votes, percentage, party
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.key.contest)
            .bind(&record.key.candidate)
            .bind(&record.key.jurisdiction)
            .bind(meta.version as i64)
            .bind(votes_to_db(record.votes)?)
            .bind(record.percentage)
            .bind(record.party.as_str())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }

        tx.commit().await?;

        tracing::info!(
            version = meta.version,
            written = delta.write_count(),
            added = delta.added.len(),
            changed = delta.changed.len(),
            unchanged = delta.unchanged.len(),
            "Snapshot committed"
        );
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

fn votes_to_db(votes: u64) -> Result<i64> {
    i64::try_from(votes)
        .map_err(|_| Error::InvalidInput(format!("Vote count {} exceeds storage range", votes)))
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

fn meta_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SnapshotMeta> {
    let source_timestamp: String = row.try_get("source_timestamp")?;
    let ingested_at: String = row.try_get("ingested_at")?;

    Ok(SnapshotMeta {
        version: row.try_get::<i64, _>("version")? as u64,
        source_timestamp: parse_timestamp(&source_timestamp, "source_timestamp")?,
        etag: row.try_get("etag")?,
        ingested_at: parse_timestamp(&ingested_at, "ingested_at")?,
        record_count: row.try_get::<i64, _>("record_count")? as usize,
        added: row.try_get::<i64, _>("added_count")? as usize,
        changed: row.try_get::<i64, _>("changed_count")? as usize,
    })
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ResultRecord> {
    let party: String = row.try_get("party")?;
    Ok(ResultRecord {
        key: RecordKey {
            contest: row.try_get("contest")?,
            candidate: row.try_get("candidate")?,
            jurisdiction: row.try_get("jurisdiction")?,
        },
        votes: row.try_get::<i64, _>("votes")? as u64,
        percentage: row.try_get("percentage")?,
        party: PartyPreference::classify(&party),
    })
}
