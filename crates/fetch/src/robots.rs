//! Per-host robots.txt cache. Missing or unparseable robots fail open: a
//! transport error allows the fetch (logged), a 4xx caches permissive rules,
//! a 5xx caches allow for five minutes before re-asking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use trawler_core::CrawlError;

/// robots.txt responses larger than this are truncated.
const MAX_ROBOTS_SIZE: usize = 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Negative-cache TTL after a 5xx.
const NEGATIVE_TTL: Duration = Duration::from_secs(300);

struct RobotsEntry {
    /// None means allow-everything (no robots, 4xx, or 5xx negative cache).
    rules: Option<String>,
    expires_at: Instant,
}

pub struct RobotsCache {
    http: reqwest::Client,
    user_agent: String,
    ttl: Duration,
    entries: DashMap<String, RobotsEntry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl RobotsCache {
    pub fn new(user_agent: &str, ttl: Duration) -> Result<Self, CrawlError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            http,
            user_agent: user_agent.to_owned(),
            // the cache holds rules for at least an hour regardless of config
            ttl: ttl.max(Duration::from_secs(3600)),
            entries: DashMap::new(),
            inflight: DashMap::new(),
        })
    }

    /// Whether `user_agent` (the cache's configured agent) may fetch `url`.
    pub async fn allowed(&self, url: &Url, ctx: &CancellationToken) -> Result<bool, CrawlError> {
        let Some(host_key) = Self::host_key(url) else {
            return Ok(true);
        };

        if let Some(allowed) = self.check_cached(&host_key, url) {
            metrics::counter!("robots_cache_total", "result" => "hit").increment(1);
            return Ok(allowed);
        }
        metrics::counter!("robots_cache_total", "result" => "miss").increment(1);

        let gate = Arc::clone(
            self.inflight
                .entry(host_key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _flight = tokio::select! {
            _ = ctx.cancelled() => return Err(CrawlError::Canceled),
            guard = gate.lock() => guard,
        };
        if let Some(allowed) = self.check_cached(&host_key, url) {
            return Ok(allowed);
        }

        let robots_url = format!("{host_key}/robots.txt");
        let fetched = tokio::select! {
            _ = ctx.cancelled() => return Err(CrawlError::Canceled),
            r = self.fetch_robots(&robots_url) => r,
        };
        self.inflight.remove(&host_key);

        let entry = match fetched {
            Ok(Some(rules)) => RobotsEntry {
                rules: Some(rules),
                expires_at: Instant::now() + self.ttl,
            },
            // 4xx: no rules published, everything is allowed
            Ok(None) => RobotsEntry {
                rules: None,
                expires_at: Instant::now() + self.ttl,
            },
            Err(FetchFailure::Server) => RobotsEntry {
                rules: None,
                expires_at: Instant::now() + NEGATIVE_TTL,
            },
            Err(FetchFailure::Transport(e)) => {
                // fail open, but do not cache: the next call re-asks
                warn!(%robots_url, "robots fetch failed, allowing: {e}");
                return Ok(true);
            }
        };
        let allowed = Self::matches(&entry, &self.user_agent, url);
        self.entries.insert(host_key, entry);
        Ok(allowed)
    }

    fn check_cached(&self, host_key: &str, url: &Url) -> Option<bool> {
        let entry = self.entries.get(host_key)?;
        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.entries.remove(host_key);
            return None;
        }
        Some(Self::matches(&entry, &self.user_agent, url))
    }

    fn matches(entry: &RobotsEntry, user_agent: &str, url: &Url) -> bool {
        match &entry.rules {
            None => true,
            Some(rules) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(rules, user_agent, url.as_str())
            }
        }
    }

    fn host_key(url: &Url) -> Option<String> {
        let host = url.host_str()?;
        match url.port() {
            Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
            None => Some(format!("{}://{}", url.scheme(), host)),
        }
    }

    async fn fetch_robots(&self, robots_url: &str) -> Result<Option<String>, FetchFailure> {
        let resp = self
            .http
            .get(robots_url)
            .send()
            .await
            .map_err(|e| FetchFailure::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_client_error() {
            debug!(robots_url, status = status.as_u16(), "no robots.txt, allowing");
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(FetchFailure::Server);
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchFailure::Transport(e.to_string()))?;
        let body = if body.len() > MAX_ROBOTS_SIZE {
            &body[..MAX_ROBOTS_SIZE]
        } else {
            &body[..]
        };
        Ok(Some(String::from_utf8_lossy(body).into_owned()))
    }
}

enum FetchFailure {
    Server,
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> RobotsCache {
        RobotsCache::new("trawler-test", Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test]
    async fn disallow_rule_blocks_path() {
        let mut server = mockito::Server::new_async().await;
        let robots = server
            .mock("GET", "/robots.txt")
            .with_status(200)
            .with_body("User-agent: *\nDisallow: /private/\n")
            .expect(1)
            .create_async()
            .await;

        let cache = cache();
        let ctx = CancellationToken::new();
        let blocked = Url::parse(&format!("{}/private/page", server.url())).unwrap();
        let open = Url::parse(&format!("{}/public", server.url())).unwrap();

        assert!(!cache.allowed(&blocked, &ctx).await.unwrap());
        assert!(cache.allowed(&open, &ctx).await.unwrap());
        // second check came from cache
        robots.assert_async().await;
    }

    #[tokio::test]
    async fn missing_robots_allows_everything() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/robots.txt")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let cache = cache();
        let ctx = CancellationToken::new();
        let url = Url::parse(&format!("{}/anything", server.url())).unwrap();
        assert!(cache.allowed(&url, &ctx).await.unwrap());
        // 404 is cached as permissive; no refetch
        assert!(cache.allowed(&url, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn server_error_fails_open() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/robots.txt")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let cache = cache();
        let ctx = CancellationToken::new();
        let url = Url::parse(&format!("{}/x", server.url())).unwrap();
        assert!(cache.allowed(&url, &ctx).await.unwrap());
        // negative cache absorbs the second call
        assert!(cache.allowed(&url, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn agent_specific_rules_apply() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/robots.txt")
            .with_status(200)
            .with_body("User-agent: trawler-test\nDisallow: /\n\nUser-agent: *\nAllow: /\n")
            .create_async()
            .await;

        let cache = cache();
        let ctx = CancellationToken::new();
        let url = Url::parse(&format!("{}/x", server.url())).unwrap();
        assert!(!cache.allowed(&url, &ctx).await.unwrap());
    }
}
