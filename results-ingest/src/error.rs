//! Error types for results-ingest
//!
//! Ingestion errors never reach readers: the scheduler contains them,
//! records them on the cycle status and keeps the last committed version.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::models::Regression;

/// Feed could not be parsed at all
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("Feed body is empty")]
    Empty,

    #[error("Unexpected header: expected columns {expected}, found {found}")]
    Header { expected: String, found: String },

    #[error("CSV error: {0}")]
    Csv(String),
}

/// Failure of one ingestion cycle
#[derive(Debug, Error)]
pub enum IngestError {
    /// Feed unreachable; retried on the next tick
    #[error("Feed unavailable after {attempts} attempt(s): {reason}")]
    FetchUnavailable { attempts: u32, reason: String },

    #[error("Feed parse error: {0}")]
    Parse(#[from] ParseError),

    /// Too many malformed rows
    #[error("Feed integrity error: {skipped} of {total} rows malformed (limit {max_ratio})")]
    FeedIntegrity {
        skipped: usize,
        total: usize,
        max_ratio: f64,
    },

    /// A vote count went down
    #[error("Regressed vote count in {} record(s): {}", .regressions.len(), format_regressions(.regressions))]
    RegressedCount { regressions: Vec<Regression> },

    /// Feed is older than the committed snapshot
    #[error("Stale feed: source timestamp {feed} is older than committed {committed}")]
    StaleFeed {
        feed: DateTime<Utc>,
        committed: DateTime<Utc>,
    },

    /// Commit lost a race against a higher version
    #[error("Stale version: attempted to commit {attempted}, store already at {current}")]
    StaleVersion { attempted: u64, current: u64 },

    /// Transactional failure; the transaction was rolled back
    #[error("Store error: {0}")]
    Store(#[from] results_common::Error),

    #[error("Ingestion cycle exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Store(results_common::Error::Database(err))
    }
}

impl IngestError {
    /// Needs operator attention rather than a plain retry
    pub fn is_alert_worthy(&self) -> bool {
        matches!(
            self,
            IngestError::FeedIntegrity { .. }
                | IngestError::RegressedCount { .. }
                | IngestError::StaleFeed { .. }
        )
    }

    /// Safe to retry the whole cycle from scratch
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::FetchUnavailable { .. }
                | IngestError::StaleVersion { .. }
                | IngestError::Store(_)
                | IngestError::DeadlineExceeded(_)
        )
    }
}

fn format_regressions(regressions: &[Regression]) -> String {
    const SHOWN: usize = 5;
    let mut text = regressions
        .iter()
        .take(SHOWN)
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if regressions.len() > SHOWN {
        text.push_str(&format!(", ... ({} more)", regressions.len() - SHOWN));
    }
    text
}

/// Read-path failure. Ingestion problems never surface here.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Store error: {0}")]
    Store(#[from] results_common::Error),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown snapshot version: {0}")]
    UnknownVersion(u64),
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        QueryError::Store(results_common::Error::Database(err))
    }
}

/// Cache backend failure; callers treat it as a miss
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// The scheduler actor is gone
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is not running")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKey;

    #[test]
    fn test_alert_classification() {
        let regression = IngestError::RegressedCount {
            regressions: vec![Regression {
                key: RecordKey::new("Mayor", "A", "1"),
                previous_votes: 100,
                new_votes: 90,
            }],
        };
        assert!(regression.is_alert_worthy());
        assert!(!regression.is_retryable());

        let stale = IngestError::StaleVersion { attempted: 3, current: 3 };
        assert!(!stale.is_alert_worthy());
        assert!(stale.is_retryable());

        let fetch = IngestError::FetchUnavailable { attempts: 3, reason: "503".to_string() };
        assert!(fetch.is_retryable());
    }

    #[test]
    fn test_regression_message_is_bounded() {
        let regressions = (0..8)
            .map(|i| Regression {
                key: RecordKey::new("Mayor", format!("C{}", i), "1"),
                previous_votes: 10,
                new_votes: 9,
            })
            .collect();
        let message = IngestError::RegressedCount { regressions }.to_string();
        assert!(message.starts_with("Regressed vote count in 8 record(s)"));
        assert!(message.contains("Mayor/C0/1 10 -> 9"));
        assert!(message.contains("(3 more)"));
        assert!(!message.contains("Mayor/C7/1"));
    }
}
