//! Database initialization
//!
//! Opens (or creates) the SQLite results store and brings its schema up to
//! date. Every table is created with `CREATE TABLE IF NOT EXISTS`, so running
//! initialization against an existing database is safe.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema revision, recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits for the write lock before failing
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL lets readers keep reading the last committed version while the
    // ingestion cycle holds the write transaction. Connection options apply
    // to every pooled connection, not just the first.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_snapshot_metadata_table(pool).await?;
    create_result_records_table(pool).await?;
    create_ingestion_cycles_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One row per committed snapshot; the highest version is current
async fn create_snapshot_metadata_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot_metadata (
            version INTEGER PRIMARY KEY,
            source_timestamp TEXT NOT NULL,
            etag TEXT,
            ingested_at TEXT NOT NULL,
            record_count INTEGER NOT NULL,
            added_count INTEGER NOT NULL,
            changed_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Versioned result rows. A record's state at version V is its row with the
/// highest version <= V; rows are only ever inserted.
async fn create_result_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS result_records (
            contest TEXT NOT NULL,
            candidate TEXT NOT NULL,
            jurisdiction TEXT NOT NULL,
            version INTEGER NOT NULL REFERENCES snapshot_metadata(version),
            votes INTEGER NOT NULL CHECK (votes >= 0),
            percentage REAL NOT NULL,
            party TEXT NOT NULL,
            PRIMARY KEY (contest, candidate, jurisdiction, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_result_records_version ON result_records(version)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_result_records_jurisdiction ON result_records(jurisdiction, version)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Ingestion cycle audit trail
async fn create_ingestion_cycles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_cycles (
            cycle_id TEXT PRIMARY KEY,
            trigger_source TEXT NOT NULL,
            state TEXT NOT NULL,
            version INTEGER,
            added_count INTEGER NOT NULL DEFAULT 0,
            changed_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
