//! Narrow write-side capabilities used by the workers: a blob store for
//! streamed bodies and a catalog for structured output. Workers are
//! idempotent, so nothing here promises more than per-call atomicity.

pub mod fs_blob;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use trawler_core::{CrawlError, Extracted};

/// Metadata recorded for every completed fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlMeta {
    pub job_id: String,
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub size: u64,
    pub depth: u32,
    pub fetched_at: DateTime<Utc>,
}

/// Sink for streamed response bodies. A writer that is neither closed nor
/// discarded leaves at most a partial temp file behind; only `close` makes
/// the blob addressable.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn open_writer(
        &self,
        job_id: &str,
        fingerprint: &str,
    ) -> Result<Box<dyn BlobWriter>, CrawlError>;

    async fn read(&self, content_ref: &str) -> Result<Vec<u8>, CrawlError>;
}

#[async_trait]
pub trait BlobWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CrawlError>;

    /// Finish the blob and return its content_ref.
    async fn close(self: Box<Self>) -> Result<String, CrawlError>;

    /// Drop a partial blob (size cap exceeded, transfer aborted).
    async fn discard(self: Box<Self>) -> Result<(), CrawlError>;
}

/// Structured-output sink. All writes are idempotent by fingerprint: running
/// the same crawl twice leaves the same catalog state modulo timestamps.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn record_crawl(&self, fingerprint: &str, meta: &CrawlMeta) -> Result<(), CrawlError>;

    async fn record_extract(
        &self,
        fingerprint: &str,
        extracted: &Extracted,
    ) -> Result<(), CrawlError>;

    async fn update_validators(
        &self,
        fingerprint: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), CrawlError>;

    /// Failure marker for permanently failed URLs; they never re-enter the
    /// frontier, this is their paper trail.
    async fn record_failure(&self, fingerprint: &str, reason: &str) -> Result<(), CrawlError>;
}
