//! End-to-end pipeline scenarios: memory queue backend, memory catalog and
//! blob store, a mockito origin server, and the real supervisor.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use trawler_core::config::{CrawlConfig, FetchConfig, RateConfig, RetryConfig, WorkersConfig};
use trawler_core::{CrawlError, CrawlUrl};
use trawler_fetch::{DnsCache, Fetcher, RateLimiter, Resolve, RobotsCache};
use trawler_parser::HtmlParser;
use trawler_queue::memory::InMemoryQueue;
use trawler_queue::{QueueBackend, QueueName, QueuePayload, QueueSettings};
use trawler_storage::memory::{MemoryBlobStore, MemoryCatalog};
use trawler_workers::{InFlightIndex, Supervisor, WorkerContext, WorkerRole};

struct StubResolver;

#[async_trait]
impl Resolve for StubResolver {
    async fn lookup(&self, _host: &str) -> Result<Vec<IpAddr>, CrawlError> {
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

struct Harness {
    supervisor: Supervisor,
    catalog: MemoryCatalog,
    blobs: MemoryBlobStore,
    queues: Arc<dyn QueueBackend>,
}

fn harness(max_depth: u32, max_retries: u32) -> Harness {
    let queues: Arc<dyn QueueBackend> = Arc::new(InMemoryQueue::new(QueueSettings {
        visibility_timeout: Duration::from_secs(60),
        max_retries,
    }));
    let rate = Arc::new(RateLimiter::new(RateConfig {
        rps: 1000.0,
        burst: 100,
        jitter: 0.0,
        per_domain: true,
    }));
    let robots = Arc::new(RobotsCache::new("trawler-test", Duration::from_secs(3600)).unwrap());
    let fetcher = Arc::new(
        Fetcher::new(
            FetchConfig {
                user_agent: "trawler-test".into(),
                max_content_size: 1024 * 1024,
                max_redirects: 5,
                timeout_seconds: 5,
            },
            Arc::clone(&rate),
            Arc::clone(&robots),
        )
        .unwrap(),
    );
    let catalog = MemoryCatalog::new();
    let blobs = MemoryBlobStore::new();

    let ctx = WorkerContext {
        queues: Arc::clone(&queues),
        rate,
        dns: Arc::new(DnsCache::new(Arc::new(StubResolver), Duration::from_secs(600))),
        robots,
        fetcher,
        render: None,
        parser: Arc::new(HtmlParser::new()),
        catalog: Arc::new(catalog.clone()),
        blobs: Arc::new(blobs.clone()),
        inflight: Arc::new(InFlightIndex::new()),
        retry: RetryConfig {
            base_seconds: 0.05,
            cap_seconds: 1.0,
            jitter: 0.0,
        },
        crawl: CrawlConfig {
            max_depth,
            job_id: "job-test".into(),
        },
        workers: WorkersConfig {
            num_crawl_workers: 2,
            num_parse_workers: 1,
            shutdown_grace_seconds: 5,
            parse_hwm: 1000,
            parse_lwm: 500,
        },
        visibility_timeout: Duration::from_secs(60),
    };

    Harness {
        supervisor: Supervisor::new(ctx),
        catalog,
        blobs,
        queues,
    }
}

async fn seed(h: &Harness, url: &str) -> CrawlUrl {
    let rec = CrawlUrl::new(url, "job-test").unwrap();
    h.queues
        .push(
            QueueName::Frontier,
            QueuePayload::Crawl(rec.clone()),
            rec.priority,
            Utc::now(),
        )
        .await
        .unwrap();
    rec
}

async fn drain(h: &Harness, budget: Duration) -> bool {
    let ctx = CancellationToken::new();
    tokio::time::timeout(budget, h.supervisor.wait_until_idle(&ctx))
        .await
        .unwrap_or(false)
}

#[tokio::test]
async fn happy_path_crawls_seed_and_discovered_links() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/robots.txt").with_status(404).create_async().await;
    server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/x">x</a><a href="/y">y</a></body></html>"#)
        .create_async()
        .await;
    server
        .mock("GET", "/x")
        .with_status(200)
        .with_body("<html>leaf x</html>")
        .create_async()
        .await;
    server
        .mock("GET", "/y")
        .with_status(200)
        .with_body("<html>leaf y</html>")
        .create_async()
        .await;

    let h = harness(1, 3);
    seed(&h, &format!("{}/", server.url())).await;
    h.supervisor.start().await;

    assert!(drain(&h, Duration::from_secs(15)).await, "crawl never drained");
    h.supervisor.stop().await;

    // seed plus both discovered links, no retries, queues empty
    assert_eq!(h.catalog.crawls.len(), 3);
    assert_eq!(h.blobs.len(), 3);
    assert_eq!(h.queues.size(QueueName::Frontier).await.unwrap(), 0);
    assert_eq!(h.queues.size(QueueName::Parse).await.unwrap(), 0);
    assert_eq!(h.queues.size(QueueName::Dead).await.unwrap(), 0);
    assert!(h.catalog.failures.is_empty());

    // every child is linked back to its parent
    let seed_fp = CrawlUrl::new(&format!("{}/", server.url()), "job-test")
        .unwrap()
        .fingerprint;
    let extract = h.catalog.extracts.get(&seed_fp).unwrap();
    assert_eq!(extract.links.len(), 2);
}

#[tokio::test]
async fn depth_cap_stops_discovery() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/robots.txt").with_status(404).create_async().await;
    server
        .mock("GET", "/")
        .with_status(200)
        .with_body(r#"<a href="/deeper">go</a>"#)
        .create_async()
        .await;

    // max_depth 0: the seed is fetched, its links are not enqueued
    let h = harness(0, 3);
    seed(&h, &format!("{}/", server.url())).await;
    h.supervisor.start().await;
    assert!(drain(&h, Duration::from_secs(10)).await);
    h.supervisor.stop().await;

    assert_eq!(h.catalog.crawls.len(), 1);
    assert_eq!(h.queues.size(QueueName::Frontier).await.unwrap(), 0);
}

#[tokio::test]
async fn revisit_with_etag_gets_304_and_writes_nothing() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/robots.txt").with_status(404).create_async().await;
    server
        .mock("GET", "/")
        .match_header("if-none-match", "W/\"abc\"")
        .with_status(304)
        .create_async()
        .await;

    let h = harness(1, 3);
    let mut rec = CrawlUrl::new(&format!("{}/", server.url()), "job-test").unwrap();
    rec.etag = Some("W/\"abc\"".into());
    h.queues
        .push(QueueName::Frontier, QueuePayload::Crawl(rec.clone()), 5, Utc::now())
        .await
        .unwrap();

    h.supervisor.start().await;
    assert!(drain(&h, Duration::from_secs(10)).await);
    h.supervisor.stop().await;

    assert!(h.blobs.is_empty());
    assert!(h.catalog.extracts.is_empty());
    assert!(h.catalog.validators.is_empty());
    let crawl = h.catalog.crawls.get(&rec.fingerprint).unwrap();
    assert_eq!(crawl.status, 304);
    assert_eq!(h.queues.size(QueueName::Parse).await.unwrap(), 0);
}

#[tokio::test]
async fn transient_503_retries_then_succeeds() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/robots.txt").with_status(404).create_async().await;
    let failing = server
        .mock("GET", "/flaky")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;

    let h = harness(1, 10);
    let rec = seed(&h, &format!("{}/flaky", server.url())).await;
    h.supervisor.start().await;

    // let at least one failed attempt land, then heal the endpoint
    tokio::time::sleep(Duration::from_millis(300)).await;
    failing.remove_async().await;
    server
        .mock("GET", "/flaky")
        .with_status(200)
        .with_body("<html>recovered</html>")
        .create_async()
        .await;

    assert!(drain(&h, Duration::from_secs(15)).await);
    h.supervisor.stop().await;

    let crawl = h.catalog.crawls.get(&rec.fingerprint).unwrap();
    assert_eq!(crawl.status, 200);
    assert_eq!(h.queues.size(QueueName::Dead).await.unwrap(), 0);
    assert_eq!(h.blobs.len(), 1);
}

#[tokio::test]
async fn persistent_500_dead_letters_after_max_retries() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/robots.txt").with_status(404).create_async().await;
    server
        .mock("GET", "/broken")
        .with_status(500)
        .expect_at_least(3)
        .create_async()
        .await;

    let h = harness(1, 2);
    let rec = seed(&h, &format!("{}/broken", server.url())).await;
    h.supervisor.start().await;

    // poll for the promotion rather than guessing total back-off time
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if h.queues.size(QueueName::Dead).await.unwrap() == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "record never dead-lettered");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    h.supervisor.stop().await;

    assert_eq!(h.queues.size(QueueName::Frontier).await.unwrap(), 0);
    assert!(h.supervisor.context().inflight.is_empty());

    let dead = h.queues.try_lease(QueueName::Dead).await.unwrap().unwrap();
    assert_eq!(dead.record.payload.fingerprint(), rec.fingerprint);
    assert!(dead
        .record
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("500"));
}

#[tokio::test]
async fn permanent_404_is_acked_with_failure_marker() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/robots.txt").with_status(404).create_async().await;
    server
        .mock("GET", "/gone")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let h = harness(1, 3);
    let rec = seed(&h, &format!("{}/gone", server.url())).await;
    h.supervisor.start().await;
    assert!(drain(&h, Duration::from_secs(10)).await);
    h.supervisor.stop().await;

    // acked, never retried, never dead-lettered, failure recorded
    assert_eq!(h.queues.size(QueueName::Frontier).await.unwrap(), 0);
    assert_eq!(h.queues.size(QueueName::Dead).await.unwrap(), 0);
    let failure = h.catalog.failures.get(&rec.fingerprint).unwrap();
    assert!(failure.contains("404"));
}

#[tokio::test]
async fn robots_disallow_blocks_fetch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/robots.txt")
        .with_status(200)
        .with_body("User-agent: *\nDisallow: /private/\n")
        .create_async()
        .await;
    let page = server
        .mock("GET", "/private/page")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let h = harness(1, 3);
    let rec = seed(&h, &format!("{}/private/page", server.url())).await;
    h.supervisor.start().await;
    assert!(drain(&h, Duration::from_secs(10)).await);
    h.supervisor.stop().await;

    page.assert_async().await;
    assert!(h.blobs.is_empty());
    assert_eq!(
        h.catalog.failures.get(&rec.fingerprint).unwrap().as_str(),
        "blocked_robots"
    );
}

#[tokio::test]
async fn scale_adjusts_worker_counts() {
    let h = harness(1, 3);
    h.supervisor.start().await;
    assert_eq!(h.supervisor.worker_count(WorkerRole::Crawl).await, 2);
    assert_eq!(h.supervisor.worker_count(WorkerRole::Parse).await, 1);

    h.supervisor.scale(WorkerRole::Crawl, 5).await;
    assert_eq!(h.supervisor.worker_count(WorkerRole::Crawl).await, 5);

    h.supervisor.scale(WorkerRole::Crawl, 1).await;
    assert_eq!(h.supervisor.worker_count(WorkerRole::Crawl).await, 1);

    h.supervisor.stop().await;
}
