//! Aggregate views served to readers
//!
//! Views are derived from the committed records of one version and carry
//! that version with them. Percentages are recomputed from vote counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::delta::Delta;
use super::record::{PartyPreference, ResultRecord, SnapshotMeta};

const KEY_PREFIX: &str = "results";

/// Kind of rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// Per contest, per candidate totals across jurisdictions
    ContestTotals,
    /// Per contest and jurisdiction candidate results
    JurisdictionBreakdown,
    /// Overall counts
    Summary,
    /// Votes per party preference
    PartyTotals,
}

impl ViewKind {
    pub const ALL: [ViewKind; 4] = [
        ViewKind::ContestTotals,
        ViewKind::JurisdictionBreakdown,
        ViewKind::Summary,
        ViewKind::PartyTotals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::ContestTotals => "contest_totals",
            ViewKind::JurisdictionBreakdown => "jurisdiction_breakdown",
            ViewKind::Summary => "summary",
            ViewKind::PartyTotals => "party_totals",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown view kind: {}", s))
    }
}

/// Optional record filters; `None` means all
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewFilters {
    pub contest: Option<String>,
    pub jurisdiction: Option<String>,
}

impl ViewFilters {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contest(contest: impl Into<String>) -> Self {
        Self {
            contest: Some(contest.into()),
            jurisdiction: None,
        }
    }

    pub fn with_jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.jurisdiction = Some(jurisdiction.into());
        self
    }

    /// Trim values and treat blank filters as absent
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            contest: clean(self.contest),
            jurisdiction: clean(self.jurisdiction),
        }
    }

    pub fn matches(&self, record: &ResultRecord) -> bool {
        self.contest
            .as_deref()
            .map_or(true, |c| c == record.key.contest)
            && self
                .jurisdiction
                .as_deref()
                .map_or(true, |j| j == record.key.jurisdiction)
    }
}

/// Cache key of a view. Filter values are escaped so that a ':' inside an
/// identifier cannot collide with the separator.
pub fn view_key(kind: ViewKind, filters: &ViewFilters) -> String {
    fn escape(value: Option<&str>) -> String {
        value
            .unwrap_or("")
            .replace('%', "%25")
            .replace(':', "%3A")
    }
    format!(
        "{}:{}:c={}:j={}",
        KEY_PREFIX,
        kind,
        escape(filters.contest.as_deref()),
        escape(filters.jurisdiction.as_deref())
    )
}

/// Every view key whose content depends on a record in the delta.
///
/// A view filtered by (contest, jurisdiction) is affected when some written
/// record matches its filters, so for each affected pair the four filter
/// shapes (none, contest, jurisdiction, both) are touched for every kind.
pub fn affected_view_keys(delta: &Delta) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    if delta.is_empty() {
        return keys;
    }

    let scopes = delta.affected_scopes();
    for kind in ViewKind::ALL {
        keys.insert(view_key(kind, &ViewFilters::all()));
        for (contest, jurisdiction) in &scopes {
            keys.insert(view_key(kind, &ViewFilters::contest(*contest)));
            keys.insert(view_key(
                kind,
                &ViewFilters::all().with_jurisdiction(*jurisdiction),
            ));
            keys.insert(view_key(
                kind,
                &ViewFilters::contest(*contest).with_jurisdiction(*jurisdiction),
            ));
        }
    }
    keys
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTotal {
    pub candidate: String,
    pub party: PartyPreference,
    pub votes: u64,
    /// Share of the enclosing total, 0.0 - 100.0
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestTotals {
    pub contest: String,
    pub total_votes: u64,
    pub candidates: Vec<CandidateTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionResult {
    pub contest: String,
    pub jurisdiction: String,
    pub total_votes: u64,
    pub candidates: Vec<CandidateTotal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewSummary {
    pub total_votes: u64,
    pub contests: usize,
    pub candidates: usize,
    pub jurisdictions: usize,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyTotal {
    pub party: PartyPreference,
    pub votes: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ViewBody {
    Contests(Vec<ContestTotals>),
    Jurisdictions(Vec<JurisdictionResult>),
    Summary(ViewSummary),
    Parties(Vec<PartyTotal>),
}

/// Read-optimized rollup tagged with the version it was computed against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateView {
    pub kind: ViewKind,
    pub filters: ViewFilters,
    /// Snapshot version; 0 when nothing has been committed yet
    pub version: u64,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub body: ViewBody,
}

impl AggregateView {
    /// Roll up `records` (the committed state at `meta`) into a view
    pub fn build(
        kind: ViewKind,
        filters: &ViewFilters,
        meta: Option<&SnapshotMeta>,
        records: &[ResultRecord],
    ) -> Self {
        let selected: Vec<&ResultRecord> =
            records.iter().filter(|r| filters.matches(r)).collect();

        let body = match kind {
            ViewKind::ContestTotals => ViewBody::Contests(contest_totals(&selected)),
            ViewKind::JurisdictionBreakdown => {
                ViewBody::Jurisdictions(jurisdiction_results(&selected))
            }
            ViewKind::Summary => ViewBody::Summary(summary(&selected)),
            ViewKind::PartyTotals => ViewBody::Parties(party_totals(&selected)),
        };

        Self {
            kind,
            filters: filters.clone(),
            version: meta.map_or(0, |m| m.version),
            source_timestamp: meta.map(|m| m.source_timestamp),
            body,
        }
    }

    /// Cache key this view is stored under
    pub fn cache_key(&self) -> String {
        view_key(self.kind, &self.filters)
    }

    /// Contest totals, if this is a contest view
    pub fn contests(&self) -> Option<&[ContestTotals]> {
        match &self.body {
            ViewBody::Contests(contests) => Some(contests),
            _ => None,
        }
    }

    /// Votes of `candidate` in `contest` (contest views only)
    pub fn candidate_votes(&self, contest: &str, candidate: &str) -> Option<u64> {
        self.contests()?
            .iter()
            .find(|c| c.contest == contest)?
            .candidates
            .iter()
            .find(|c| c.candidate == candidate)
            .map(|c| c.votes)
    }
}

/// Vote totals saturate at `u64::MAX` instead of wrapping
fn sum_votes(votes: impl Iterator<Item = u64>) -> u64 {
    votes.fold(0u64, |total, v| total.saturating_add(v))
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Sum votes per candidate; party comes from the first record seen
fn candidate_totals<'a>(records: impl Iterator<Item = &'a ResultRecord>) -> (u64, Vec<CandidateTotal>) {
    let mut by_candidate: BTreeMap<&str, (PartyPreference, u64)> = BTreeMap::new();
    for record in records {
        let entry = by_candidate
            .entry(record.key.candidate.as_str())
            .or_insert((record.party, 0));
        entry.1 = entry.1.saturating_add(record.votes);
    }

    let total = sum_votes(by_candidate.values().map(|(_, votes)| *votes));
    let mut candidates: Vec<CandidateTotal> = by_candidate
        .into_iter()
        .map(|(candidate, (party, votes))| CandidateTotal {
            candidate: candidate.to_string(),
            party,
            votes,
            percentage: percentage(votes, total),
        })
        .collect();
    candidates.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| a.candidate.cmp(&b.candidate)));
    (total, candidates)
}

fn contest_totals(records: &[&ResultRecord]) -> Vec<ContestTotals> {
    let mut by_contest: BTreeMap<&str, Vec<&ResultRecord>> = BTreeMap::new();
    for record in records {
        by_contest
            .entry(record.key.contest.as_str())
            .or_default()
            .push(*record);
    }

    by_contest
        .into_iter()
        .map(|(contest, rows)| {
            let (total_votes, candidates) = candidate_totals(rows.into_iter());
            ContestTotals {
                contest: contest.to_string(),
                total_votes,
                candidates,
            }
        })
        .collect()
}

fn jurisdiction_results(records: &[&ResultRecord]) -> Vec<JurisdictionResult> {
    let mut by_scope: BTreeMap<(&str, &str), Vec<&ResultRecord>> = BTreeMap::new();
    for record in records {
        by_scope
            .entry((record.key.contest.as_str(), record.key.jurisdiction.as_str()))
            .or_default()
            .push(*record);
    }

    by_scope
        .into_iter()
        .map(|((contest, jurisdiction), rows)| {
            let (total_votes, candidates) = candidate_totals(rows.into_iter());
            JurisdictionResult {
                contest: contest.to_string(),
                jurisdiction: jurisdiction.to_string(),
                total_votes,
                candidates,
            }
        })
        .collect()
}

fn summary(records: &[&ResultRecord]) -> ViewSummary {
    let contests: BTreeSet<&str> = records.iter().map(|r| r.key.contest.as_str()).collect();
    let candidates: BTreeSet<(&str, &str)> = records
        .iter()
        .map(|r| (r.key.contest.as_str(), r.key.candidate.as_str()))
        .collect();
    let jurisdictions: BTreeSet<&str> =
        records.iter().map(|r| r.key.jurisdiction.as_str()).collect();

    ViewSummary {
        total_votes: sum_votes(records.iter().map(|r| r.votes)),
        contests: contests.len(),
        candidates: candidates.len(),
        jurisdictions: jurisdictions.len(),
        records: records.len(),
    }
}

fn party_totals(records: &[&ResultRecord]) -> Vec<PartyTotal> {
    let mut by_party: BTreeMap<PartyPreference, u64> = BTreeMap::new();
    for record in records {
        let votes = by_party.entry(record.party).or_insert(0);
        *votes = votes.saturating_add(record.votes);
    }
    let total = sum_votes(by_party.values().copied());

    let mut parties: Vec<PartyTotal> = by_party
        .into_iter()
        .map(|(party, votes)| PartyTotal {
            party,
            votes,
            percentage: percentage(votes, total),
        })
        .collect();
    parties.sort_by(|a, b| b.votes.cmp(&a.votes));
    parties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangedRecord, RecordKey};

    fn record(contest: &str, candidate: &str, jurisdiction: &str, votes: u64) -> ResultRecord {
        ResultRecord::new(RecordKey::new(contest, candidate, jurisdiction), votes, 0.0)
    }

    fn meta(version: u64) -> SnapshotMeta {
        SnapshotMeta {
            version,
            source_timestamp: Utc::now(),
            etag: None,
            ingested_at: Utc::now(),
            record_count: 0,
            added: 0,
            changed: 0,
        }
    }

    #[test]
    fn test_contest_totals_sum_across_jurisdictions() {
        let records = vec![
            record("Mayor", "A", "1", 100),
            record("Mayor", "A", "2", 50),
            record("Mayor", "B", "1", 80),
            record("Council", "C", "1", 10),
        ];

        let view = AggregateView::build(ViewKind::ContestTotals, &ViewFilters::all(), Some(&meta(3)), &records);

        assert_eq!(view.version, 3);
        assert_eq!(view.candidate_votes("Mayor", "A"), Some(150));
        assert_eq!(view.candidate_votes("Mayor", "B"), Some(80));
        assert_eq!(view.candidate_votes("Council", "C"), Some(10));

        let mayor = view.contests().unwrap().iter().find(|c| c.contest == "Mayor").unwrap();
        assert_eq!(mayor.total_votes, 230);
        // sorted by votes descending
        assert_eq!(mayor.candidates[0].candidate, "A");
        assert!((mayor.candidates[0].percentage - 150.0 / 230.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_filters_restrict_records() {
        let records = vec![
            record("Mayor", "A", "1", 100),
            record("Mayor", "A", "2", 50),
            record("Council", "C", "1", 10),
        ];

        let filters = ViewFilters::contest("Mayor").with_jurisdiction("2");
        let view = AggregateView::build(ViewKind::JurisdictionBreakdown, &filters, Some(&meta(1)), &records);

        match view.body {
            ViewBody::Jurisdictions(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].jurisdiction, "2");
                assert_eq!(rows[0].total_votes, 50);
                assert_eq!(rows[0].candidates[0].percentage, 100.0);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_summary_and_parties() {
        let records = vec![
            record("Mayor", "A", "1", 100).with_party(PartyPreference::Democrat),
            record("Mayor", "B", "1", 50).with_party(PartyPreference::Republican),
            record("Mayor", "A", "2", 25).with_party(PartyPreference::Democrat),
        ];

        let view = AggregateView::build(ViewKind::Summary, &ViewFilters::all(), Some(&meta(1)), &records);
        assert_eq!(
            view.body,
            ViewBody::Summary(ViewSummary {
                total_votes: 175,
                contests: 1,
                candidates: 2,
                jurisdictions: 2,
                records: 3,
            })
        );

        let view = AggregateView::build(ViewKind::PartyTotals, &ViewFilters::all(), Some(&meta(1)), &records);
        match view.body {
            ViewBody::Parties(parties) => {
                assert_eq!(parties[0].party, PartyPreference::Democrat);
                assert_eq!(parties[0].votes, 125);
                assert_eq!(parties[1].votes, 50);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_large_totals_saturate() {
        let max = i64::MAX as u64;
        let records = vec![
            record("Mayor", "A", "1", max),
            record("Mayor", "A", "2", max),
            record("Mayor", "A", "3", max),
            record("Mayor", "B", "1", max),
        ];

        let view = AggregateView::build(ViewKind::ContestTotals, &ViewFilters::all(), Some(&meta(1)), &records);
        assert_eq!(view.candidate_votes("Mayor", "A"), Some(u64::MAX));
        let mayor = &view.contests().unwrap()[0];
        assert_eq!(mayor.total_votes, u64::MAX);

        let view = AggregateView::build(ViewKind::Summary, &ViewFilters::all(), Some(&meta(1)), &records);
        match view.body {
            ViewBody::Summary(summary) => assert_eq!(summary.total_votes, u64::MAX),
            other => panic!("unexpected body {:?}", other),
        }

        let view = AggregateView::build(ViewKind::PartyTotals, &ViewFilters::all(), Some(&meta(1)), &records);
        match view.body {
            ViewBody::Parties(parties) => assert_eq!(parties[0].votes, u64::MAX),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_empty_store_view_has_version_zero() {
        let view = AggregateView::build(ViewKind::ContestTotals, &ViewFilters::all(), None, &[]);
        assert_eq!(view.version, 0);
        assert_eq!(view.source_timestamp, None);
        assert_eq!(view.contests(), Some(&[][..]));
    }

    #[test]
    fn test_view_key_escapes_separators() {
        let plain = view_key(ViewKind::Summary, &ViewFilters::contest("a:b"));
        let other = view_key(ViewKind::Summary, &ViewFilters::contest("a").with_jurisdiction("b"));
        assert_ne!(plain, other);
        assert_eq!(plain, "results:summary:c=a%3Ab:j=");
    }

    #[test]
    fn test_affected_keys_cover_matching_filters() {
        let delta = Delta {
            changed: vec![ChangedRecord {
                previous_votes: 1,
                record: record("Mayor", "A", "1", 2),
            }],
            ..Default::default()
        };

        let keys = affected_view_keys(&delta);
        for kind in ViewKind::ALL {
            assert!(keys.contains(&view_key(kind, &ViewFilters::all())));
            assert!(keys.contains(&view_key(kind, &ViewFilters::contest("Mayor"))));
            assert!(keys.contains(&view_key(kind, &ViewFilters::all().with_jurisdiction("1"))));
            assert!(keys.contains(&view_key(kind, &ViewFilters::contest("Mayor").with_jurisdiction("1"))));
        }
        assert!(!keys.contains(&view_key(ViewKind::ContestTotals, &ViewFilters::contest("Council"))));
        assert_eq!(keys.len(), ViewKind::ALL.len() * 4);

        assert!(affected_view_keys(&Delta::default()).is_empty());
    }

    #[test]
    fn test_filters_normalized() {
        let filters = ViewFilters {
            contest: Some("  Mayor ".to_string()),
            jurisdiction: Some("   ".to_string()),
        }
        .normalized();
        assert_eq!(filters, ViewFilters::contest("Mayor"));
    }
}
