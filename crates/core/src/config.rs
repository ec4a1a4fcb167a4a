use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub robots: RobotsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// "memory" or "redis".
    #[serde(default = "default_queue_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            visibility_timeout_seconds: default_visibility_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_crawl_workers")]
    pub num_crawl_workers: usize,
    #[serde(default = "default_parse_workers")]
    pub num_parse_workers: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Crawl leasing pauses while the parse queue is above the high-water
    /// mark and resumes below the low-water mark.
    #[serde(default = "default_parse_hwm")]
    pub parse_hwm: u64,
    #[serde(default = "default_parse_lwm")]
    pub parse_lwm: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            num_crawl_workers: default_crawl_workers(),
            num_parse_workers: default_parse_workers(),
            shutdown_grace_seconds: default_shutdown_grace(),
            parse_hwm: default_parse_hwm(),
            parse_lwm: default_parse_lwm(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateConfig {
    #[serde(default = "default_rps")]
    pub rps: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_rate_jitter")]
    pub jitter: f64,
    #[serde(default = "default_true")]
    pub per_domain: bool,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            burst: default_burst(),
            jitter: default_rate_jitter(),
            per_domain: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_dns_ttl")]
    pub ttl_seconds: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_dns_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RobotsConfig {
    #[serde(default = "default_robots_ttl")]
    pub ttl_seconds: u64,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_robots_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_content_size")]
    pub max_content_size: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_content_size: default_max_content_size(),
            max_redirects: default_max_redirects(),
            timeout_seconds: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_job_id")]
    pub job_id: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            job_id: default_job_id(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base")]
    pub base_seconds: f64,
    #[serde(default = "default_retry_cap")]
    pub cap_seconds: f64,
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base(),
            cap_seconds: default_retry_cap(),
            jitter: default_retry_jitter(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RendererConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_render_pool")]
    pub pool_size: usize,
    #[serde(default = "default_page_timeout")]
    pub page_timeout_seconds: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: default_render_pool(),
            page_timeout_seconds: default_page_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
    /// "memory" or "postgres".
    #[serde(default = "default_catalog_backend")]
    pub catalog: String,
    #[serde(default)]
    pub postgres_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            catalog: default_catalog_backend(),
            postgres_url: String::new(),
        }
    }
}

fn default_queue_backend() -> String { "memory".into() }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".into() }
fn default_key_prefix() -> String { "trawler".into() }
fn default_visibility_timeout() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_crawl_workers() -> usize { 5 }
fn default_parse_workers() -> usize { 3 }
fn default_shutdown_grace() -> u64 { 30 }
fn default_parse_hwm() -> u64 { 5000 }
fn default_parse_lwm() -> u64 { 2500 }
fn default_rps() -> f64 { 2.0 }
fn default_burst() -> u32 { 10 }
fn default_rate_jitter() -> f64 { 0.1 }
fn default_true() -> bool { true }
fn default_dns_ttl() -> u64 { 600 }
fn default_robots_ttl() -> u64 { 3600 }
fn default_user_agent() -> String { "trawler/0.1 (+https://github.com/trawler)".into() }
fn default_max_content_size() -> u64 { 100 * 1024 * 1024 }
fn default_max_redirects() -> u32 { 5 }
fn default_fetch_timeout() -> u64 { 30 }
fn default_max_depth() -> u32 { 3 }
fn default_job_id() -> String { "default".into() }
fn default_retry_base() -> f64 { 30.0 }
fn default_retry_cap() -> f64 { 3600.0 }
fn default_retry_jitter() -> f64 { 0.2 }
fn default_render_pool() -> usize { 3 }
fn default_page_timeout() -> u64 { 45 }
fn default_blob_dir() -> String { "data/blobs".into() }
fn default_catalog_backend() -> String { "memory".into() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.queue.backend, "memory");
        assert_eq!(cfg.workers.num_crawl_workers, 5);
        assert_eq!(cfg.workers.num_parse_workers, 3);
        assert_eq!(cfg.rate.rps, 2.0);
        assert_eq!(cfg.rate.burst, 10);
        assert!(cfg.rate.per_domain);
        assert_eq!(cfg.fetch.max_content_size, 100 * 1024 * 1024);
        assert_eq!(cfg.queue.visibility_timeout_seconds, 300);
        assert!(!cfg.renderer.enabled);
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [queue]
            backend = "redis"
            max_retries = 7

            [rate]
            rps = 0.5
            per_domain = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.queue.backend, "redis");
        assert_eq!(cfg.queue.max_retries, 7);
        assert_eq!(cfg.rate.rps, 0.5);
        assert!(!cfg.rate.per_domain);
        // untouched sections keep defaults
        assert_eq!(cfg.crawl.max_depth, 3);
    }
}
