use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::error::CrawlError;

/// Priority range is [0, 10]; higher dispatches earlier.
pub const MIN_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// A frontier entry. `fingerprint` doubles as the record id: two CrawlUrls
/// with the same fingerprint are the same URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlUrl {
    /// Canonical absolute URL.
    pub url: String,
    /// Hex SHA-256 of `url`.
    pub fingerprint: String,
    /// Grouping key for one crawl run.
    pub job_id: String,
    pub priority: u8,
    pub depth: u32,
    pub requires_js: bool,
    pub is_dynamic: bool,
    /// Fingerprint of the page this URL was discovered on; None for seeds.
    pub discovered_from: Option<String>,
    /// Incremented each time the record is enqueued for retry.
    pub attempts: u32,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// The record must not be dispatched before this instant.
    pub next_available_at: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
}

impl CrawlUrl {
    /// Canonicalizes `raw` and derives the fingerprint. Fails on URLs that
    /// cannot be canonicalized (no host, bad syntax).
    pub fn new(raw: &str, job_id: impl Into<String>) -> Result<Self, CrawlError> {
        let url = canonical::canonicalize(raw)?;
        let fingerprint = canonical::fingerprint(&url);
        Ok(Self {
            url,
            fingerprint,
            job_id: job_id.into(),
            priority: DEFAULT_PRIORITY,
            depth: 0,
            requires_js: false,
            is_dynamic: false,
            discovered_from: None,
            attempts: 0,
            etag: None,
            last_modified: None,
            next_available_at: None,
            tags: BTreeSet::new(),
        })
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Canonical host, used as the rate-limiter bucket key.
    pub fn domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_owned())
    }
}

/// Hand-off from a successful crawl to the parse pool. The body itself stays
/// in the blob store; parse workers only ever see `content_ref`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseItem {
    pub content_ref: String,
    pub url: String,
    pub final_url: String,
    pub fingerprint: String,
    pub job_id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub depth: u32,
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Ok,
    NotModified,
    SkippedTooLarge,
    BlockedRobots,
    BlockedRate,
    Error,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotModified => "not_modified",
            Self::SkippedTooLarge => "skipped_too_large",
            Self::BlockedRobots => "blocked_robots",
            Self::BlockedRate => "blocked_rate",
            Self::Error => "error",
        }
    }
}

/// What came back from one fetch or render attempt.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub outcome: FetchOutcome,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub final_url: String,
    /// Present only for `Ok`; points into the blob store.
    pub content_ref: Option<String>,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub error: Option<String>,
    pub retryable: bool,
    /// Server-supplied back-off hint (Retry-After).
    pub retry_after: Option<Duration>,
}

impl FetchResult {
    pub fn error(status: Option<u16>, reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            outcome: FetchOutcome::Error,
            status,
            headers: HashMap::new(),
            final_url: String::new(),
            content_ref: None,
            size: 0,
            etag: None,
            last_modified: None,
            fetched_at: Utc::now(),
            error: Some(reason.into()),
            retryable,
            retry_after: None,
        }
    }

    pub fn skipped(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            status: None,
            headers: HashMap::new(),
            final_url: String::new(),
            content_ref: None,
            size: 0,
            etag: None,
            last_modified: None,
            fetched_at: Utc::now(),
            error: None,
            retryable: false,
            retry_after: None,
        }
    }
}

/// Result of a parse pass over a stored body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extracted {
    /// Absolute canonical URLs discovered in the document.
    pub links: Vec<String>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub language: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_url_canonicalizes_and_fingerprints() {
        let a = CrawlUrl::new("HTTP://Example.com/?b=2&a=1", "job").unwrap();
        let b = CrawlUrl::new("http://example.com?a=1&b=2", "job").unwrap();
        assert_eq!(a.url, b.url);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn priority_is_clamped() {
        let rec = CrawlUrl::new("http://example.com/", "job")
            .unwrap()
            .with_priority(99);
        assert_eq!(rec.priority, MAX_PRIORITY);
    }

    #[test]
    fn domain_is_canonical_host() {
        let rec = CrawlUrl::new("https://WWW.Example.org:443/x", "job").unwrap();
        assert_eq!(rec.domain(), "www.example.org");
    }
}
