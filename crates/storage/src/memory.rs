//! In-memory catalog and blob store. The default for single-process runs
//! without a database, and what the worker tests assert against.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use trawler_core::{CrawlError, Extracted};

use crate::{BlobStore, BlobWriter, Catalog, CrawlMeta};

#[derive(Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open_writer(
        &self,
        job_id: &str,
        fingerprint: &str,
    ) -> Result<Box<dyn BlobWriter>, CrawlError> {
        Ok(Box::new(MemoryBlobWriter {
            blobs: Arc::clone(&self.blobs),
            content_ref: format!("{job_id}/{fingerprint}"),
            buf: Vec::new(),
        }))
    }

    async fn read(&self, content_ref: &str) -> Result<Vec<u8>, CrawlError> {
        self.blobs
            .get(content_ref)
            .map(|b| b.clone())
            .ok_or_else(|| CrawlError::Storage(format!("no blob for {content_ref}")))
    }
}

struct MemoryBlobWriter {
    blobs: Arc<DashMap<String, Vec<u8>>>,
    content_ref: String,
    buf: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CrawlError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<String, CrawlError> {
        let this = *self;
        this.blobs.insert(this.content_ref.clone(), this.buf);
        Ok(this.content_ref)
    }

    async fn discard(self: Box<Self>) -> Result<(), CrawlError> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryCatalog {
    pub crawls: Arc<DashMap<String, CrawlMeta>>,
    pub extracts: Arc<DashMap<String, Extracted>>,
    pub validators: Arc<DashMap<String, (Option<String>, Option<String>)>>,
    pub failures: Arc<DashMap<String, String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn record_crawl(&self, fingerprint: &str, meta: &CrawlMeta) -> Result<(), CrawlError> {
        self.crawls.insert(fingerprint.to_owned(), meta.clone());
        Ok(())
    }

    async fn record_extract(
        &self,
        fingerprint: &str,
        extracted: &Extracted,
    ) -> Result<(), CrawlError> {
        self.extracts.insert(fingerprint.to_owned(), extracted.clone());
        Ok(())
    }

    async fn update_validators(
        &self,
        fingerprint: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), CrawlError> {
        self.validators.insert(
            fingerprint.to_owned(),
            (etag.map(str::to_owned), last_modified.map(str::to_owned)),
        );
        Ok(())
    }

    async fn record_failure(&self, fingerprint: &str, reason: &str) -> Result<(), CrawlError> {
        self.failures.insert(fingerprint.to_owned(), reason.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn meta(status: u16) -> CrawlMeta {
        CrawlMeta {
            job_id: "j".into(),
            url: "http://a.com/".into(),
            final_url: "http://a.com/".into(),
            status,
            content_type: Some("text/html".into()),
            size: 10,
            depth: 0,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_crawl_is_idempotent_by_fingerprint() {
        let cat = MemoryCatalog::new();
        cat.record_crawl("fp", &meta(200)).await.unwrap();
        cat.record_crawl("fp", &meta(200)).await.unwrap();
        assert_eq!(cat.crawls.len(), 1);
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let store = MemoryBlobStore::new();
        let mut w = store.open_writer("j", "fp").await.unwrap();
        w.write_chunk(b"abc").await.unwrap();
        let content_ref = w.close().await.unwrap();
        assert_eq!(store.read(&content_ref).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn discarded_blob_never_lands() {
        let store = MemoryBlobStore::new();
        let mut w = store.open_writer("j", "fp").await.unwrap();
        w.write_chunk(b"abc").await.unwrap();
        w.discard().await.unwrap();
        assert!(store.is_empty());
    }
}
