//! Database initialization tests

use results_common::db::init::{init_database, SCHEMA_VERSION};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sub").join("results.db");

    let result = init_database(&db_path).await;
    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("results.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_all_tables_created() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("results.db")).await.unwrap();

    for table in [
        "schema_version",
        "snapshot_metadata",
        "result_records",
        "ingestion_cycles",
    ] {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "table {} missing", table);
    }

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_wal_mode_enabled() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("results.db")).await.unwrap();

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_negative_votes_rejected_by_schema() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("results.db")).await.unwrap();

    sqlx::query(
        "INSERT INTO snapshot_metadata (version, source_timestamp, ingested_at, record_count, added_count, changed_count)
         VALUES (1, '2024-11-05T20:00:00Z', '2024-11-05T20:00:01Z', 1, 1, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let result = sqlx::query(
        "INSERT INTO result_records (contest, candidate, jurisdiction, version, votes, percentage, party)
         VALUES ('Mayor', 'A', '1', 1, -5, 0.0, 'NotAffiliated')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());
}
