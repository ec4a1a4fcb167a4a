//! The worker layer: crawl workers drain the frontier through the fetch
//! pipeline, parse workers turn stored bodies into catalog rows and new
//! frontier entries, and the supervisor owns both pools plus the shared
//! caches.

pub mod crawl_worker;
pub mod inflight;
pub mod parse_worker;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use trawler_core::config::{CrawlConfig, RetryConfig, WorkersConfig};
use trawler_fetch::{DnsCache, Fetcher, RateLimiter, RenderPool, RobotsCache};
use trawler_parser::Parser;
use trawler_queue::QueueBackend;
use trawler_storage::{BlobStore, Catalog};

pub use inflight::InFlightIndex;
pub use supervisor::{Supervisor, WorkerRole};

/// Everything a worker loop needs, bundled so the supervisor can hand one
/// clone to each spawned task.
#[derive(Clone)]
pub struct WorkerContext {
    pub queues: Arc<dyn QueueBackend>,
    pub rate: Arc<RateLimiter>,
    pub dns: Arc<DnsCache>,
    pub robots: Arc<RobotsCache>,
    pub fetcher: Arc<Fetcher>,
    pub render: Option<Arc<RenderPool>>,
    pub parser: Arc<dyn Parser>,
    pub catalog: Arc<dyn Catalog>,
    pub blobs: Arc<dyn BlobStore>,
    pub inflight: Arc<InFlightIndex>,
    pub retry: RetryConfig,
    pub crawl: CrawlConfig,
    pub workers: WorkersConfig,
    pub visibility_timeout: Duration,
}

impl WorkerContext {
    /// Overall per-record budget; a handler that overruns is dropped and the
    /// record comes back via lease expiry.
    pub fn handler_timeout(&self) -> Duration {
        self.visibility_timeout * 2 / 3
    }

    pub fn retry_delay(
        &self,
        attempts: u32,
        retry_after: Option<Duration>,
    ) -> Duration {
        trawler_queue::backoff::retry_delay(
            attempts,
            Duration::from_secs_f64(self.retry.base_seconds),
            Duration::from_secs_f64(self.retry.cap_seconds),
            self.retry.jitter,
            retry_after,
        )
    }
}
