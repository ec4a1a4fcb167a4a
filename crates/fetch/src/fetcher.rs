//! HTTP fetcher: conditional GET, bounded streaming into the blob store,
//! and a manual redirect walk so every hop re-enters rate limiting and
//! robots admission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use trawler_core::config::FetchConfig;
use trawler_core::{CrawlError, CrawlUrl, FetchOutcome, FetchResult};
use trawler_storage::BlobStore;

use crate::rate_limit::RateLimiter;
use crate::robots::RobotsCache;

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];
const SPA_HINTS: [&str; 4] = ["spa", "react", "angular", "vue"];

pub struct Fetcher {
    client: reqwest::Client,
    cfg: FetchConfig,
    rate: Arc<RateLimiter>,
    robots: Arc<RobotsCache>,
}

impl Fetcher {
    pub fn new(
        cfg: FetchConfig,
        rate: Arc<RateLimiter>,
        robots: Arc<RobotsCache>,
    ) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .user_agent(&cfg.user_agent)
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            client,
            cfg,
            rate,
            robots,
        })
    }

    /// JS-rendering gate: explicit flags on the record, or URL shapes that
    /// smell like a client-side app.
    pub fn needs_render(rec: &CrawlUrl) -> bool {
        if rec.requires_js || rec.is_dynamic {
            return true;
        }
        let lower = rec.url.to_ascii_lowercase();
        SPA_HINTS.iter().any(|hint| lower.contains(hint)) || lower.contains("#/")
    }

    /// One fetch attempt for a frontier record. Preconditions: the caller
    /// already holds a rate token and a robots pass for the first hop.
    /// Returns `Err` only on cancellation or storage faults; every HTTP
    /// outcome is a `FetchResult`.
    pub async fn fetch(
        &self,
        rec: &CrawlUrl,
        blobs: &dyn BlobStore,
        ctx: &CancellationToken,
    ) -> Result<FetchResult, CrawlError> {
        let mut current = match Url::parse(&rec.url) {
            Ok(u) => u,
            Err(e) => return Ok(FetchResult::error(None, format!("bad url: {e}"), false)),
        };

        for hop in 0..=self.cfg.max_redirects {
            if hop > 0 {
                // redirect targets re-enter admission control
                if !self.robots.allowed(&current, ctx).await? {
                    let mut result = FetchResult::skipped(FetchOutcome::BlockedRobots);
                    result.final_url = current.to_string();
                    return Ok(result);
                }
                self.rate
                    .acquire(current.host_str().unwrap_or("unknown"), ctx)
                    .await?;
            }

            let mut req = self.client.get(current.as_str());
            if let Some(etag) = &rec.etag {
                req = req.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &rec.last_modified {
                req = req.header(header::IF_MODIFIED_SINCE, last_modified);
            }

            let resp = tokio::select! {
                _ = ctx.cancelled() => return Err(CrawlError::Canceled),
                r = req.send() => r,
            };
            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    let reason = if e.is_timeout() {
                        format!("timeout fetching {current}")
                    } else {
                        format!("transport: {e}")
                    };
                    return Ok(FetchResult::error(None, reason, true));
                }
            };

            let status = resp.status().as_u16();
            if REDIRECT_STATUSES.contains(&status) {
                let Some(location) = resp
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Ok(FetchResult::error(
                        Some(status),
                        "redirect without Location",
                        false,
                    ));
                };
                current = match current.join(location) {
                    Ok(u) => u,
                    Err(e) => {
                        return Ok(FetchResult::error(
                            Some(status),
                            format!("bad redirect target {location}: {e}"),
                            false,
                        ))
                    }
                };
                debug!(url = %rec.url, hop, location, "following redirect");
                continue;
            }

            return self.consume(resp, rec, blobs, ctx).await;
        }

        Ok(FetchResult::error(
            None,
            format!("redirect chain exceeded {} hops", self.cfg.max_redirects),
            false,
        ))
    }

    async fn consume(
        &self,
        resp: reqwest::Response,
        rec: &CrawlUrl,
        blobs: &dyn BlobStore,
        ctx: &CancellationToken,
    ) -> Result<FetchResult, CrawlError> {
        let status = resp.status().as_u16();
        let headers = harvest_headers(&resp);
        let final_url = resp.url().to_string();
        let etag = headers.get("etag").cloned();
        let last_modified = headers.get("last-modified").cloned();

        match status {
            304 => {
                return Ok(FetchResult {
                    outcome: FetchOutcome::NotModified,
                    status: Some(status),
                    headers,
                    final_url,
                    content_ref: None,
                    size: 0,
                    etag,
                    last_modified,
                    fetched_at: Utc::now(),
                    error: None,
                    retryable: false,
                    retry_after: None,
                })
            }
            200..=299 => {}
            429 | 503 => {
                let retry_after = parse_retry_after(&headers);
                return Ok(FetchResult {
                    retry_after,
                    ..FetchResult::error(Some(status), format!("http {status}"), true)
                });
            }
            408 | 425 => {
                return Ok(FetchResult::error(
                    Some(status),
                    format!("http {status}"),
                    true,
                ))
            }
            400..=499 => {
                return Ok(FetchResult::error(
                    Some(status),
                    format!("http {status}"),
                    false,
                ))
            }
            _ => {
                return Ok(FetchResult::error(
                    Some(status),
                    format!("http {status}"),
                    true,
                ))
            }
        }

        // admission before the body: a declared oversize never opens a writer
        if let Some(len) = resp.content_length() {
            if len > self.cfg.max_content_size {
                debug!(url = %rec.url, len, "skipping oversized body by content-length");
                return Ok(FetchResult {
                    outcome: FetchOutcome::SkippedTooLarge,
                    status: Some(status),
                    headers,
                    final_url,
                    content_ref: None,
                    size: len,
                    etag,
                    last_modified,
                    fetched_at: Utc::now(),
                    error: None,
                    retryable: false,
                    retry_after: None,
                });
            }
        }

        let mut writer = blobs.open_writer(&rec.job_id, &rec.fingerprint).await?;
        let mut stream = resp.bytes_stream();
        let mut size: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = ctx.cancelled() => {
                    let _ = writer.discard().await;
                    return Err(CrawlError::Canceled);
                }
                c = stream.next() => c,
            };
            match chunk {
                None => break,
                Some(Err(e)) => {
                    let _ = writer.discard().await;
                    return Ok(FetchResult::error(
                        Some(status),
                        format!("body read: {e}"),
                        true,
                    ));
                }
                Some(Ok(bytes)) => {
                    size += bytes.len() as u64;
                    if size > self.cfg.max_content_size {
                        // abort the transfer and drop the partial blob
                        let _ = writer.discard().await;
                        debug!(url = %rec.url, size, "aborting oversized streaming body");
                        return Ok(FetchResult {
                            outcome: FetchOutcome::SkippedTooLarge,
                            status: Some(status),
                            headers,
                            final_url,
                            content_ref: None,
                            size,
                            etag,
                            last_modified,
                            fetched_at: Utc::now(),
                            error: None,
                            retryable: false,
                            retry_after: None,
                        });
                    }
                    if let Err(e) = writer.write_chunk(&bytes).await {
                        let _ = writer.discard().await;
                        return Err(e);
                    }
                }
            }
        }

        let content_ref = writer.close().await?;
        Ok(FetchResult {
            outcome: FetchOutcome::Ok,
            status: Some(status),
            headers,
            final_url,
            content_ref: Some(content_ref),
            size,
            etag,
            last_modified,
            fetched_at: Utc::now(),
            error: None,
            retryable: false,
            retry_after: None,
        })
    }
}

fn harvest_headers(resp: &reqwest::Response) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (k, v) in resp.headers() {
        if let Ok(val) = v.to_str() {
            headers.insert(k.as_str().to_ascii_lowercase(), val.to_owned());
        }
    }
    headers
}

fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trawler_core::config::RateConfig;
    use trawler_storage::memory::MemoryBlobStore;

    fn fetcher(max_content_size: u64, max_redirects: u32) -> Fetcher {
        let rate = Arc::new(RateLimiter::new(RateConfig {
            rps: 10_000.0,
            burst: 1_000,
            jitter: 0.0,
            per_domain: true,
        }));
        let robots =
            Arc::new(RobotsCache::new("trawler-test", Duration::from_secs(3600)).unwrap());
        Fetcher::new(
            FetchConfig {
                user_agent: "trawler-test".into(),
                max_content_size,
                max_redirects,
                timeout_seconds: 5,
            },
            rate,
            robots,
        )
        .unwrap()
    }

    fn rec(url: &str) -> CrawlUrl {
        CrawlUrl::new(url, "job-1").unwrap()
    }

    #[tokio::test]
    async fn ok_streams_body_and_captures_validators() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("etag", "W/\"abc\"")
            .with_header("last-modified", "Wed, 01 Jan 2025 00:00:00 GMT")
            .with_body("<html>hi</html>")
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 5);
        let ctx = CancellationToken::new();
        let url = format!("{}/page", server.url());
        let result = f.fetch(&rec(&url), &blobs, &ctx).await.unwrap();

        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.etag.as_deref(), Some("W/\"abc\""));
        assert_eq!(result.size, 15);
        let body = blobs.read(result.content_ref.as_deref().unwrap()).await.unwrap();
        assert_eq!(body, b"<html>hi</html>");
    }

    #[tokio::test]
    async fn not_modified_never_touches_blob_store() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/page")
            .match_header("if-none-match", "W/\"abc\"")
            .with_status(304)
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 5);
        let ctx = CancellationToken::new();
        let url = format!("{}/page", server.url());
        let mut record = rec(&url);
        record.etag = Some("W/\"abc\"".into());

        let result = f.fetch(&record, &blobs, &ctx).await.unwrap();
        assert_eq!(result.outcome, FetchOutcome::NotModified);
        assert!(result.content_ref.is_none());
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn declared_oversize_rejected_before_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big")
            .with_status(200)
            .with_body(vec![b'x'; 2048])
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 5);
        let ctx = CancellationToken::new();
        let url = format!("{}/big", server.url());
        let result = f.fetch(&rec(&url), &blobs, &ctx).await.unwrap();

        assert_eq!(result.outcome, FetchOutcome::SkippedTooLarge);
        assert_eq!(result.size, 2048);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn streaming_oversize_discards_partial_blob() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/chunked")
            .with_status(200)
            .with_chunked_body(|w| {
                for _ in 0..64 {
                    w.write_all(&[b'x'; 64])?;
                }
                Ok(())
            })
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 5);
        let ctx = CancellationToken::new();
        let url = format!("{}/chunked", server.url());
        let result = f.fetch(&rec(&url), &blobs, &ctx).await.unwrap();

        assert_eq!(result.outcome, FetchOutcome::SkippedTooLarge);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn status_classes_map_to_retryability() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/gone").with_status(404).create_async().await;
        server.mock("GET", "/boom").with_status(500).create_async().await;
        server
            .mock("GET", "/busy")
            .with_status(503)
            .with_header("retry-after", "2")
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 5);
        let ctx = CancellationToken::new();
        let base = server.url();

        let gone = f.fetch(&rec(&format!("{base}/gone")), &blobs, &ctx).await.unwrap();
        assert_eq!(gone.outcome, FetchOutcome::Error);
        assert!(!gone.retryable);

        let boom = f.fetch(&rec(&format!("{base}/boom")), &blobs, &ctx).await.unwrap();
        assert!(boom.retryable);

        let busy = f.fetch(&rec(&format!("{base}/busy")), &blobs, &ctx).await.unwrap();
        assert!(busy.retryable);
        assert_eq!(busy.retry_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn redirects_are_followed_through_admission() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/robots.txt").with_status(404).create_async().await;
        server
            .mock("GET", "/a")
            .with_status(302)
            .with_header("location", "/b")
            .create_async()
            .await;
        server
            .mock("GET", "/b")
            .with_status(200)
            .with_body("landed")
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 5);
        let ctx = CancellationToken::new();
        let url = format!("{}/a", server.url());
        let result = f.fetch(&rec(&url), &blobs, &ctx).await.unwrap();

        assert_eq!(result.outcome, FetchOutcome::Ok);
        assert!(result.final_url.ends_with("/b"));
        let body = blobs.read(result.content_ref.as_deref().unwrap()).await.unwrap();
        assert_eq!(body, b"landed");
    }

    #[tokio::test]
    async fn redirect_loop_is_permanent_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/robots.txt").with_status(404).create_async().await;
        server
            .mock("GET", "/loop")
            .with_status(302)
            .with_header("location", "/loop")
            .expect_at_least(1)
            .create_async()
            .await;

        let blobs = MemoryBlobStore::new();
        let f = fetcher(1024, 3);
        let ctx = CancellationToken::new();
        let url = format!("{}/loop", server.url());
        let result = f.fetch(&rec(&url), &blobs, &ctx).await.unwrap();

        assert_eq!(result.outcome, FetchOutcome::Error);
        assert!(!result.retryable);
    }

    #[test]
    fn render_gate_heuristics() {
        let mut record = rec("http://example.com/plain");
        assert!(!Fetcher::needs_render(&record));
        record.requires_js = true;
        assert!(Fetcher::needs_render(&record));

        let spa = rec("http://example.com/react-app/index");
        assert!(Fetcher::needs_render(&spa));
    }
}
