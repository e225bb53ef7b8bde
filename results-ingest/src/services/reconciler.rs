//! Delta reconciler
//!
//! Classifies a freshly normalized feed against the committed snapshot.
//! Any regressed vote count fails the whole cycle; nothing is applied
//! partially.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::IngestError;
use crate::models::{ChangedRecord, Delta, IngestionSnapshot, RecordKey, Regression, ResultRecord};

/// Reject a feed published before the committed snapshot
pub fn check_freshness(
    previous: Option<&IngestionSnapshot>,
    source_timestamp: DateTime<Utc>,
) -> Result<(), IngestError> {
    if let Some(previous) = previous {
        if source_timestamp < previous.meta.source_timestamp {
            tracing::error!(
                feed = %source_timestamp,
                committed = %previous.meta.source_timestamp,
                version = previous.meta.version,
                "Out-of-order feed rejected"
            );
            return Err(IngestError::StaleFeed {
                feed: source_timestamp,
                committed: previous.meta.source_timestamp,
            });
        }
    }
    Ok(())
}

/// Compute the delta between `previous` and the normalized `next` records.
///
/// Duplicate identities within `next` collapse to the last row. Identities
/// missing from `next` are carried forward untouched.
pub fn reconcile(
    previous: Option<&IngestionSnapshot>,
    next: Vec<ResultRecord>,
) -> Result<Delta, IngestError> {
    let (records, duplicates) = dedup_last_wins(next);

    let mut delta = Delta {
        duplicates,
        ..Default::default()
    };
    let mut regressions = Vec::new();

    for record in records {
        match previous.and_then(|p| p.get(&record.key)) {
            None => delta.added.push(record),
            Some(prior) if prior.votes == record.votes => delta.unchanged.push(record.key),
            Some(prior) => {
                if record.votes < prior.votes {
                    regressions.push(Regression {
                        key: record.key.clone(),
                        previous_votes: prior.votes,
                        new_votes: record.votes,
                    });
                }
                delta.changed.push(ChangedRecord {
                    previous_votes: prior.votes,
                    record,
                });
            }
        }
    }

    if !regressions.is_empty() {
        tracing::error!(
            count = regressions.len(),
            first = %regressions[0],
            "Vote count regression detected, rejecting feed"
        );
        return Err(IngestError::RegressedCount { regressions });
    }

    tracing::debug!(
        added = delta.added.len(),
        changed = delta.changed.len(),
        unchanged = delta.unchanged.len(),
        duplicates = delta.duplicates,
        "Feed reconciled"
    );

    Ok(delta)
}

/// Keep the last row per identity, preserving first-seen order
fn dedup_last_wins(records: Vec<ResultRecord>) -> (Vec<ResultRecord>, usize) {
    let mut position: HashMap<RecordKey, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<ResultRecord> = Vec::with_capacity(records.len());
    let mut duplicates = 0;

    for record in records {
        match position.get(&record.key) {
            Some(&index) => {
                tracing::warn!(
                    key = %record.key,
                    kept_votes = record.votes,
                    dropped_votes = unique[index].votes,
                    "Duplicate identity in feed, last row wins"
                );
                duplicates += 1;
                unique[index] = record;
            }
            None => {
                position.insert(record.key.clone(), unique.len());
                unique.push(record);
            }
        }
    }

    (unique, duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotMeta;
    use chrono::Duration;

    fn record(contest: &str, candidate: &str, jurisdiction: &str, votes: u64) -> ResultRecord {
        ResultRecord::new(RecordKey::new(contest, candidate, jurisdiction), votes, 0.0)
    }

    fn snapshot(version: u64, records: Vec<ResultRecord>) -> IngestionSnapshot {
        IngestionSnapshot {
            meta: SnapshotMeta {
                version,
                source_timestamp: Utc::now(),
                etag: None,
                ingested_at: Utc::now(),
                record_count: records.len(),
                added: records.len(),
                changed: 0,
            },
            records: records.into_iter().map(|r| (r.key.clone(), r)).collect(),
        }
    }

    #[test]
    fn test_first_feed_is_all_added() {
        let delta = reconcile(None, vec![record("Mayor", "A", "1", 100)]).unwrap();
        assert_eq!(delta.added.len(), 1);
        assert!(delta.changed.is_empty());
        assert!(delta.unchanged.is_empty());
    }

    #[test]
    fn test_mayor_example() {
        let v1 = snapshot(1, vec![record("Mayor", "A", "1", 100)]);
        let next = vec![record("Mayor", "A", "1", 150), record("Mayor", "B", "1", 80)];

        let delta = reconcile(Some(&v1), next).unwrap();

        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].previous_votes, 100);
        assert_eq!(delta.changed[0].record.votes, 150);
        assert_eq!(delta.added, vec![record("Mayor", "B", "1", 80)]);
        assert!(delta.unchanged.is_empty());
    }

    #[test]
    fn test_unchanged_records_are_not_written() {
        let v1 = snapshot(1, vec![record("Mayor", "A", "1", 100)]);
        let delta = reconcile(Some(&v1), vec![record("Mayor", "A", "1", 100)]).unwrap();
        assert!(delta.is_empty());
        assert_eq!(delta.unchanged, vec![RecordKey::new("Mayor", "A", "1")]);
    }

    #[test]
    fn test_regression_fails_whole_cycle() {
        let v1 = snapshot(
            1,
            vec![record("Mayor", "A", "1", 100), record("Mayor", "B", "1", 50)],
        );
        let next = vec![
            record("Mayor", "A", "1", 200),
            record("Mayor", "B", "1", 40),
            record("Mayor", "C", "1", 5),
        ];

        match reconcile(Some(&v1), next) {
            Err(IngestError::RegressedCount { regressions }) => {
                assert_eq!(regressions.len(), 1);
                assert_eq!(regressions[0].key, RecordKey::new("Mayor", "B", "1"));
                assert_eq!((regressions[0].previous_votes, regressions[0].new_votes), (50, 40));
            }
            other => panic!("expected RegressedCount, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_identity_last_row_wins() {
        let next = vec![
            record("Mayor", "A", "1", 10),
            record("Mayor", "B", "1", 20),
            record("Mayor", "A", "1", 30),
        ];
        let delta = reconcile(None, next).unwrap();

        assert_eq!(delta.duplicates, 1);
        assert_eq!(delta.added.len(), 2);
        assert_eq!(delta.added[0], record("Mayor", "A", "1", 30));
    }

    #[test]
    fn test_missing_identities_are_carried_forward() {
        let v1 = snapshot(
            1,
            vec![record("Mayor", "A", "1", 100), record("Mayor", "B", "1", 50)],
        );
        let delta = reconcile(Some(&v1), vec![record("Mayor", "A", "1", 120)]).unwrap();
        assert_eq!(delta.changed.len(), 1);
        assert!(delta.added.is_empty());
    }

    #[test]
    fn test_freshness() {
        let v1 = snapshot(1, vec![]);
        let committed = v1.meta.source_timestamp;

        assert!(check_freshness(None, committed).is_ok());
        assert!(check_freshness(Some(&v1), committed).is_ok());
        assert!(check_freshness(Some(&v1), committed + Duration::seconds(30)).is_ok());
        assert!(matches!(
            check_freshness(Some(&v1), committed - Duration::seconds(30)),
            Err(IngestError::StaleFeed { .. })
        ));
    }
}
