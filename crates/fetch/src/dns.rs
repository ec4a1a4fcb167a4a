//! TTL cache over a `Resolve` capability. Successful lookups are cached
//! until `expires_at`; failures are never cached, so a flaky resolver
//! retries on the next call. Concurrent lookups for one host coalesce into
//! a single flight.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trawler_core::CrawlError;

#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, CrawlError>;
}

pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// System config when available, public defaults otherwise.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, CrawlError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| CrawlError::transient(format!("dns {host}: {e}")))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(CrawlError::transient(format!("dns {host}: no addresses")));
        }
        Ok(addrs)
    }
}

struct DnsEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

pub struct DnsCache {
    resolver: Arc<dyn Resolve>,
    ttl: Duration,
    entries: DashMap<String, DnsEntry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolve>, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub async fn resolve(
        &self,
        host: &str,
        ctx: &CancellationToken,
    ) -> Result<Vec<IpAddr>, CrawlError> {
        if let Some(addrs) = self.cached(host) {
            metrics::counter!("dns_cache_total", "result" => "hit").increment(1);
            return Ok(addrs);
        }
        metrics::counter!("dns_cache_total", "result" => "miss").increment(1);

        let gate = Arc::clone(
            self.inflight
                .entry(host.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _flight = tokio::select! {
            _ = ctx.cancelled() => return Err(CrawlError::Canceled),
            guard = gate.lock() => guard,
        };

        // another flight may have landed while we waited for the gate
        if let Some(addrs) = self.cached(host) {
            return Ok(addrs);
        }

        let result = tokio::select! {
            _ = ctx.cancelled() => return Err(CrawlError::Canceled),
            r = self.resolver.lookup(host) => r,
        };
        match result {
            Ok(addresses) => {
                debug!(host, count = addresses.len(), "dns resolved");
                self.entries.insert(
                    host.to_owned(),
                    DnsEntry {
                        addresses: addresses.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                self.inflight.remove(host);
                Ok(addresses)
            }
            Err(e) => {
                self.inflight.remove(host);
                Err(e)
            }
        }
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let entry = self.entries.get(host)?;
        if Instant::now() < entry.expires_at {
            Some(entry.addresses.clone())
        } else {
            drop(entry);
            self.entries.remove(host);
            None
        }
    }
}
