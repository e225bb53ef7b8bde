//! Ingestion cycle bookkeeping
//!
//! Terminal cycle statuses are persisted so `ingestion_status` can answer
//! for cycles that have aged out of the scheduler's in-memory history.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{CycleId, CycleStatus};
use crate::utils::retry_on_lock;
use results_common::{Error, Result};

const LOCK_RETRY_MS: u64 = 5000;

/// Insert or replace the row for `status`
pub async fn save_cycle(pool: &SqlitePool, status: &CycleStatus) -> Result<()> {
    retry_on_lock("save_cycle", LOCK_RETRY_MS, || async {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ingestion_cycles (
                cycle_id, trigger_source, state, version, added_count,
                changed_count, error, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(status.cycle_id.to_string())
        .bind(status.trigger.as_str())
        .bind(status.state.as_str())
        .bind(status.version.map(|v| v as i64))
        .bind(status.added as i64)
        .bind(status.changed as i64)
        .bind(status.error.as_deref())
        .bind(status.started_at.to_rfc3339())
        .bind(status.ended_at.map(|t| t.to_rfc3339()))
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Load a persisted cycle by id
pub async fn load_cycle(pool: &SqlitePool, cycle_id: CycleId) -> Result<Option<CycleStatus>> {
    let row = sqlx::query(
        r#"
        SELECT cycle_id, trigger_source, state, version, added_count,
               changed_count, error, started_at, ended_at
        FROM ingestion_cycles
        WHERE cycle_id = ?
        "#,
    )
    .bind(cycle_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id: String = row.try_get("cycle_id")?;
    let trigger: String = row.try_get("trigger_source")?;
    let state: String = row.try_get("state")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;

    Ok(Some(CycleStatus {
        cycle_id: Uuid::parse_str(&id)
            .map_err(|e| Error::Internal(format!("Failed to parse cycle_id: {}", e)))?,
        trigger: trigger.parse()?,
        state: state.parse()?,
        version: row.try_get::<Option<i64>, _>("version")?.map(|v| v as u64),
        added: row.try_get::<i64, _>("added_count")? as usize,
        changed: row.try_get::<i64, _>("changed_count")? as usize,
        error: row.try_get("error")?,
        started_at: parse_time(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_time).transpose()?,
    }))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse cycle timestamp: {}", e)))
}
