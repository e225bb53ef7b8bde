//! Result records and committed snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identity of a result: one candidate in one contest in one jurisdiction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub contest: String,
    pub candidate: String,
    pub jurisdiction: String,
}

impl RecordKey {
    pub fn new(
        contest: impl Into<String>,
        candidate: impl Into<String>,
        jurisdiction: impl Into<String>,
    ) -> Self {
        Self {
            contest: contest.into(),
            candidate: candidate.into(),
            jurisdiction: jurisdiction.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.contest, self.candidate, self.jurisdiction)
    }
}

/// Party affiliation as published in the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum PartyPreference {
    Democrat,
    Republican,
    #[default]
    NotAffiliated,
}

impl PartyPreference {
    /// Classify free-form feed text ("Prefers Democratic Party" etc.)
    pub fn classify(raw: &str) -> Self {
        let lowercase = raw.to_lowercase();
        if lowercase.contains("democrat") {
            PartyPreference::Democrat
        } else if lowercase.contains("republican") {
            PartyPreference::Republican
        } else {
            PartyPreference::NotAffiliated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartyPreference::Democrat => "Democrat",
            PartyPreference::Republican => "Republican",
            PartyPreference::NotAffiliated => "NotAffiliated",
        }
    }
}

impl FromStr for PartyPreference {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::classify(s))
    }
}

/// Normalized unit of truth. Never mutated; later versions supersede it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub key: RecordKey,
    pub votes: u64,
    /// Percentage as reported by the feed
    pub percentage: f64,
    pub party: PartyPreference,
}

impl ResultRecord {
    pub fn new(key: RecordKey, votes: u64, percentage: f64) -> Self {
        Self {
            key,
            votes,
            percentage,
            party: PartyPreference::NotAffiliated,
        }
    }

    pub fn with_party(mut self, party: PartyPreference) -> Self {
        self.party = party;
        self
    }
}

/// Metadata row of one committed version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u64,
    /// Publication time of the feed (Last-Modified, else fetch time)
    pub source_timestamp: DateTime<Utc>,
    pub etag: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub record_count: usize,
    pub added: usize,
    pub changed: usize,
}

/// Full record set of one committed version
#[derive(Debug, Clone)]
pub struct IngestionSnapshot {
    pub meta: SnapshotMeta,
    pub records: HashMap<RecordKey, ResultRecord>,
}

impl IngestionSnapshot {
    pub fn version(&self) -> u64 {
        self.meta.version
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ResultRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
