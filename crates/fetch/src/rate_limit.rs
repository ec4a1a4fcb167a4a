//! Token bucket with continuous refill and jittered waits. Per-domain mode
//! keeps an independent bucket per canonical host; contention on one domain
//! never blocks another.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use trawler_core::config::RateConfig;
use trawler_core::CrawlError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rps: f64,
    burst: f64,
    jitter: f64,
}

impl Bucket {
    fn new(cfg: &RateConfig) -> Self {
        let burst = f64::from(cfg.burst.max(1));
        Self {
            tokens: burst,
            last_refill: Instant::now(),
            rps: cfg.rps,
            burst,
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rps).min(self.burst);
            self.last_refill = now;
        }
    }

    /// Consume one token, or return how long to sleep before retrying.
    fn try_take(&mut self) -> Option<Duration> {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return None;
        }
        let wait = (1.0 - self.tokens) / self.rps.max(f64::EPSILON);
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            (wait * factor).clamp(0.0, 2.0 * wait)
        } else {
            wait
        };
        Some(Duration::from_secs_f64(jittered))
    }
}

pub struct RateLimiter {
    cfg: RateConfig,
    per_domain: bool,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    global: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(cfg: RateConfig) -> Self {
        let global = Arc::new(Mutex::new(Bucket::new(&cfg)));
        Self {
            per_domain: cfg.per_domain,
            buckets: DashMap::new(),
            global,
            cfg,
        }
    }

    fn bucket_for(&self, domain: &str) -> Arc<Mutex<Bucket>> {
        if !self.per_domain {
            return Arc::clone(&self.global);
        }
        Arc::clone(
            self.buckets
                .entry(domain.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(&self.cfg))))
                .value(),
        )
    }

    /// Blocks until a token is available for the domain's bucket, then
    /// consumes one. Returns `Canceled` if `ctx` fires first.
    pub async fn acquire(&self, domain: &str, ctx: &CancellationToken) -> Result<(), CrawlError> {
        let bucket = self.bucket_for(domain);
        let start = Instant::now();
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                match b.try_take() {
                    None => {
                        metrics::histogram!("rate_wait_seconds")
                            .record(start.elapsed().as_secs_f64());
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };
            tokio::select! {
                _ = ctx.cancelled() => return Err(CrawlError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Applies on each bucket's next refill; in-flight waits recompute from
    /// the new rate when they wake.
    pub async fn set_rps(&self, rps: f64) {
        self.global.lock().await.rps = rps;
        for entry in self.buckets.iter() {
            entry.value().lock().await.rps = rps;
        }
    }

    pub fn tracked_domains(&self) -> usize {
        self.buckets.len()
    }
}
