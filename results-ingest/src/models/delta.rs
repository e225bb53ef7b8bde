//! Record-level differences between two snapshots

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::record::{RecordKey, ResultRecord};

/// A record whose vote count moved since the previous version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedRecord {
    pub previous_votes: u64,
    pub record: ResultRecord,
}

/// A vote count that went down between versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Regression {
    pub key: RecordKey,
    pub previous_votes: u64,
    pub new_votes: u64,
}

impl std::fmt::Display for Regression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.key, self.previous_votes, self.new_votes)
    }
}

/// Difference between the committed snapshot and a freshly normalized feed.
/// Lives only for the duration of one ingestion cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub added: Vec<ResultRecord>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged: Vec<RecordKey>,
    /// Feed rows dropped because a later row carried the same identity
    pub duplicates: usize,
}

impl Delta {
    /// No record needs writing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }

    /// Number of rows the store writer will insert
    pub fn write_count(&self) -> usize {
        self.added.len() + self.changed.len()
    }

    /// Records to persist at the new version
    pub fn records_to_write(&self) -> impl Iterator<Item = &ResultRecord> {
        self.added
            .iter()
            .chain(self.changed.iter().map(|c| &c.record))
    }

    /// Contests with at least one added or changed record
    pub fn affected_contests(&self) -> BTreeSet<&str> {
        self.records_to_write()
            .map(|r| r.key.contest.as_str())
            .collect()
    }

    /// (contest, jurisdiction) pairs with at least one added or changed record
    pub fn affected_scopes(&self) -> BTreeSet<(&str, &str)> {
        self.records_to_write()
            .map(|r| (r.key.contest.as_str(), r.key.jurisdiction.as_str()))
            .collect()
    }
}
