//! Record normalizer
//!
//! Turns the raw CSV body into validated `ResultRecord`s. Malformed rows are
//! skipped and reported; too many of them fail the whole feed.

use results_common::config::NormalizeConfig;
use serde::Serialize;

use crate::error::{IngestError, ParseError};
use crate::models::{PartyPreference, RecordKey, ResultRecord};

/// Required leading columns, in order
pub const REQUIRED_COLUMNS: [&str; 5] = ["contest", "candidate", "jurisdiction", "votes", "percentage"];

/// Optional column right after the required ones
pub const PARTY_COLUMN: &str = "party";

const MAX_IDENTIFIER_LEN: usize = 256;

/// One excluded row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    /// 1-based line in the feed (the header is line 1)
    pub line: u64,
    pub reason: String,
}

/// Rows excluded from a normalization run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkippedRows {
    pub rows: Vec<SkippedRow>,
}

impl SkippedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Normalization result handed to the reconciler
#[derive(Debug, Clone, Default)]
pub struct NormalizedFeed {
    pub records: Vec<ResultRecord>,
    pub skipped: SkippedRows,
    /// Data rows seen (valid + skipped)
    pub total_rows: usize,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    max_skipped_ratio: f64,
}

impl Normalizer {
    pub fn new(config: &NormalizeConfig) -> Self {
        Self {
            max_skipped_ratio: config.max_skipped_ratio,
        }
    }

    /// Parse and validate a CSV feed body
    pub fn normalize(&self, raw_body: &str) -> Result<NormalizedFeed, IngestError> {
        if raw_body.trim().is_empty() {
            return Err(ParseError::Empty.into());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(raw_body.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| ParseError::Csv(e.to_string()))?
            .clone();
        let has_party = validate_header(&headers)?;

        let mut feed = NormalizedFeed::default();
        for (index, result) in reader.records().enumerate() {
            feed.total_rows += 1;
            // header occupies line 1; fall back to the row index if csv has no position
            let fallback_line = index as u64 + 2;

            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    let line = e.position().map_or(fallback_line, |p| p.line());
                    feed.skipped.rows.push(SkippedRow {
                        line,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let line = row.position().map_or(fallback_line, |p| p.line());

            match parse_row(&row, headers.len(), has_party) {
                Ok(record) => feed.records.push(record),
                Err(reason) => {
                    tracing::debug!(line, %reason, "Skipping malformed feed row");
                    feed.skipped.rows.push(SkippedRow { line, reason });
                }
            }
        }

        if feed.total_rows > 0 && !feed.skipped.is_empty() {
            let ratio = feed.skipped.len() as f64 / feed.total_rows as f64;
            if ratio > self.max_skipped_ratio {
                tracing::error!(
                    skipped = feed.skipped.len(),
                    total = feed.total_rows,
                    max_ratio = self.max_skipped_ratio,
                    "Feed rejected: too many malformed rows"
                );
                return Err(IngestError::FeedIntegrity {
                    skipped: feed.skipped.len(),
                    total: feed.total_rows,
                    max_ratio: self.max_skipped_ratio,
                });
            }
            tracing::warn!(
                skipped = feed.skipped.len(),
                total = feed.total_rows,
                "Skipped malformed feed rows"
            );
        }

        Ok(feed)
    }
}

/// Check the required columns; returns whether the party column is present
fn validate_header(headers: &csv::StringRecord) -> Result<bool, ParseError> {
    let found: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();

    let leading_ok = found.len() >= REQUIRED_COLUMNS.len()
        && REQUIRED_COLUMNS
            .iter()
            .zip(found.iter())
            .all(|(expected, actual)| actual == expected);

    if !leading_ok {
        return Err(ParseError::Header {
            expected: REQUIRED_COLUMNS.join(","),
            found: found.join(","),
        });
    }

    Ok(found.get(REQUIRED_COLUMNS.len()).map(String::as_str) == Some(PARTY_COLUMN))
}

fn parse_row(
    row: &csv::StringRecord,
    expected_fields: usize,
    has_party: bool,
) -> Result<ResultRecord, String> {
    if row.len() != expected_fields {
        return Err(format!(
            "expected {} fields, found {}",
            expected_fields,
            row.len()
        ));
    }

    let contest = identifier(row, 0, "contest")?;
    let candidate = identifier(row, 1, "candidate")?;
    let jurisdiction = identifier(row, 2, "jurisdiction")?;
    let votes = parse_votes(row.get(3).unwrap_or(""))?;
    let percentage = parse_percentage(row.get(4).unwrap_or(""))?;
    let party = if has_party {
        PartyPreference::classify(row.get(REQUIRED_COLUMNS.len()).unwrap_or(""))
    } else {
        PartyPreference::NotAffiliated
    };

    Ok(ResultRecord {
        key: RecordKey::new(contest, candidate, jurisdiction),
        votes,
        percentage,
        party,
    })
}

fn identifier(row: &csv::StringRecord, index: usize, column: &str) -> Result<String, String> {
    let value = row.get(index).unwrap_or("").trim();
    if value.is_empty() {
        return Err(format!("empty {}", column));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(format!("{} longer than {} characters", column, MAX_IDENTIFIER_LEN));
    }
    if value.chars().any(char::is_control) {
        return Err(format!("{} contains control characters", column));
    }
    Ok(value.to_string())
}

/// Largest vote count the store can hold (SQLite INTEGER is signed 64-bit)
const MAX_VOTES: u64 = i64::MAX as u64;

/// Non-negative integer, digits only, at most `MAX_VOTES`
fn parse_votes(raw: &str) -> Result<u64, String> {
    let value = raw.trim();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid vote count '{}'", raw));
    }
    match value.parse::<u64>() {
        Ok(votes) if votes <= MAX_VOTES => Ok(votes),
        _ => Err(format!("vote count out of range '{}'", raw)),
    }
}

/// Finite number within 0..=100; tolerates quotes, spaces and a trailing '%'
fn parse_percentage(raw: &str) -> Result<f64, String> {
    let value = raw
        .trim_matches(|c: char| c == '"' || c.is_whitespace())
        .trim_end_matches('%')
        .trim();
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("invalid percentage '{}'", raw))?;
    if !parsed.is_finite() || !(0.0..=100.0).contains(&parsed) {
        return Err(format!("percentage out of range '{}'", raw));
    }
    Ok(parsed)
}
