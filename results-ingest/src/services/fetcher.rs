//! Results feed fetcher
//!
//! Conditional GET of the published CSV with bounded retry. The fetcher
//! never touches the store; a persistent failure simply skips the cycle.

use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use results_common::config::FetchConfig;
use std::time::Duration;

use crate::error::IngestError;
use crate::utils::Backoff;

const USER_AGENT: &str = concat!("results-ingest/", env!("CARGO_PKG_VERSION"));

/// A retrieved feed body
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBody {
    pub body: String,
    pub etag: Option<String>,
    /// Parsed `Last-Modified` header, if present and valid
    pub last_modified: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

impl FeedBody {
    /// Publication time of the feed; falls back to fetch time
    pub fn source_timestamp(&self) -> DateTime<Utc> {
        self.last_modified.unwrap_or(self.fetched_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// 304: the feed has not changed since `last_etag`
    NotModified,
    Fetched(FeedBody),
}

/// Outcome of a single HTTP attempt
enum Attempt {
    Done(FetchOutcome),
    /// Worth another try (network error, timeout, 5xx, 429)
    Transient(String),
    /// Retrying will not help (other 4xx, undecodable body)
    Permanent(String),
}

pub struct FeedFetcher {
    http_client: reqwest::Client,
    feed_url: String,
    max_attempts: u32,
    backoff: Backoff,
}

impl FeedFetcher {
    pub fn new(feed_url: impl Into<String>, config: &FetchConfig) -> results_common::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                results_common::Error::Config(format!("HTTP client setup failed: {}", e))
            })?;

        Ok(Self {
            http_client,
            feed_url: feed_url.into(),
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(config.base_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
        })
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// Fetch the feed, sending `If-None-Match` when an ETag is known
    pub async fn fetch(&self, last_etag: Option<&str>) -> Result<FetchOutcome, IngestError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let reason = match self.attempt(last_etag).await {
                Attempt::Done(outcome) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Feed fetch succeeded after retry");
                    }
                    return Ok(outcome);
                }
                Attempt::Permanent(reason) => {
                    tracing::warn!(url = %self.feed_url, %reason, "Feed fetch failed permanently");
                    return Err(IngestError::FetchUnavailable {
                        attempts: attempt,
                        reason,
                    });
                }
                Attempt::Transient(reason) => reason,
            };

            if attempt >= self.max_attempts {
                tracing::warn!(
                    url = %self.feed_url,
                    attempts = attempt,
                    %reason,
                    "Feed unavailable, giving up until next cycle"
                );
                return Err(IngestError::FetchUnavailable {
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.backoff.delay(attempt);
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "Transient feed error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, last_etag: Option<&str>) -> Attempt {
        let mut request = self.http_client.get(&self.feed_url);
        if let Some(etag) = last_etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(format!("Network error: {}", e)),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!("Feed not modified");
            return Attempt::Done(FetchOutcome::NotModified);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Transient(format!("HTTP {}", status.as_u16()));
        }
        if !status.is_success() {
            return Attempt::Permanent(format!("HTTP {}", status.as_u16()));
        }

        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED)
            .and_then(|value| DateTime::parse_from_rfc2822(&value).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Attempt::Transient(format!("Body read error: {}", e)),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(e) => return Attempt::Permanent(format!("Feed is not valid UTF-8: {}", e)),
        };

        tracing::debug!(
            bytes = body.len(),
            etag = etag.as_deref().unwrap_or("-"),
            "Feed fetched"
        );

        Attempt::Done(FetchOutcome::Fetched(FeedBody {
            body,
            etag,
            last_modified,
            fetched_at: Utc::now(),
        }))
    }
}

fn header_string(
    headers: &reqwest::header::HeaderMap,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let fetcher = FeedFetcher::new("http://127.0.0.1:1/feed.csv", &FetchConfig::default());
        assert!(fetcher.is_ok());
    }

    #[test]
    fn test_source_timestamp_prefers_last_modified() {
        let fetched_at = Utc::now();
        let last_modified = DateTime::parse_from_rfc2822("Tue, 05 Nov 2024 20:15:00 GMT")
            .unwrap()
            .with_timezone(&Utc);

        let body = FeedBody {
            body: String::new(),
            etag: None,
            last_modified: Some(last_modified),
            fetched_at,
        };
        assert_eq!(body.source_timestamp(), last_modified);

        let body = FeedBody {
            last_modified: None,
            ..body
        };
        assert_eq!(body.source_timestamp(), fetched_at);
    }

    #[tokio::test]
    async fn test_unreachable_feed_is_unavailable() {
        let config = FetchConfig {
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            request_timeout_secs: 1,
        };
        // port 1 is never listening
        let fetcher = FeedFetcher::new("http://127.0.0.1:1/feed.csv", &config).unwrap();

        match fetcher.fetch(None).await {
            Err(IngestError::FetchUnavailable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected FetchUnavailable, got {:?}", other),
        }
    }
}
