use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trawler_core::{AppConfig, CrawlUrl};
use trawler_fetch::{
    ChromiumRenderer, DnsCache, Fetcher, HickoryResolver, RateLimiter, RenderPool, RobotsCache,
};
use trawler_parser::HtmlParser;
use trawler_queue::memory::InMemoryQueue;
use trawler_queue::redis::RedisQueue;
use trawler_queue::{QueueBackend, QueueName, QueuePayload, QueueSettings};
use trawler_storage::fs_blob::FsBlobStore;
use trawler_storage::memory::MemoryCatalog;
use trawler_storage::postgres::PgCatalog;
use trawler_storage::{BlobStore, Catalog};
use trawler_workers::{InFlightIndex, Supervisor, WorkerContext};

pub async fn build_queue(config: &AppConfig) -> Result<Arc<dyn QueueBackend>> {
    let settings = QueueSettings {
        visibility_timeout: Duration::from_secs(config.queue.visibility_timeout_seconds),
        max_retries: config.queue.max_retries,
    };
    match config.queue.backend.as_str() {
        "redis" => {
            let queue = RedisQueue::connect(&config.queue.redis_url, &config.queue.key_prefix, settings)
                .await
                .context("connecting to redis queue backend")?;
            info!(url = %config.queue.redis_url, "using redis queue backend");
            Ok(Arc::new(queue))
        }
        "memory" => Ok(Arc::new(InMemoryQueue::new(settings))),
        other => anyhow::bail!("unknown queue backend: {other}"),
    }
}

pub async fn run_crawl(
    mut config: AppConfig,
    seeds: Option<String>,
    seed: Option<String>,
    depth: Option<u32>,
    until_idle: bool,
) -> Result<()> {
    if let Some(depth) = depth {
        config.crawl.max_depth = depth;
    }

    let queues = build_queue(&config).await?;
    let rate = Arc::new(RateLimiter::new(config.rate.clone()));
    let robots = Arc::new(RobotsCache::new(
        &config.fetch.user_agent,
        Duration::from_secs(config.robots.ttl_seconds),
    )?);
    let dns = Arc::new(DnsCache::new(
        Arc::new(HickoryResolver::new()),
        Duration::from_secs(config.dns.ttl_seconds),
    ));
    let fetcher = Arc::new(Fetcher::new(
        config.fetch.clone(),
        Arc::clone(&rate),
        Arc::clone(&robots),
    )?);

    let render = if config.renderer.enabled {
        let renderer = ChromiumRenderer::launch()
            .await
            .context("launching headless browser")?;
        info!(pool_size = config.renderer.pool_size, "renderer enabled");
        Some(Arc::new(RenderPool::new(
            Arc::new(renderer),
            config.renderer.pool_size,
            Duration::from_secs(config.renderer.page_timeout_seconds),
        )))
    } else {
        None
    };

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.storage.blob_dir));
    let catalog: Arc<dyn Catalog> = match config.storage.catalog.as_str() {
        "postgres" => {
            let catalog = PgCatalog::connect(&config.storage.postgres_url).await?;
            catalog.run_migrations().await?;
            Arc::new(catalog)
        }
        "memory" => Arc::new(MemoryCatalog::new()),
        other => anyhow::bail!("unknown catalog backend: {other}"),
    };

    let ctx = WorkerContext {
        queues: Arc::clone(&queues),
        rate,
        dns,
        robots,
        fetcher,
        render,
        parser: Arc::new(HtmlParser::new()),
        catalog,
        blobs,
        inflight: Arc::new(InFlightIndex::new()),
        retry: config.retry.clone(),
        crawl: config.crawl.clone(),
        workers: config.workers.clone(),
        visibility_timeout: Duration::from_secs(config.queue.visibility_timeout_seconds),
    };
    let supervisor = Supervisor::new(ctx);

    // collect seeds: --seed, then --seeds as file path or comma list
    let mut seed_urls: Vec<String> = Vec::new();
    if let Some(s) = seed {
        seed_urls.push(s);
    }
    if let Some(seeds_arg) = seeds {
        if std::path::Path::new(&seeds_arg).exists() {
            let content = std::fs::read_to_string(&seeds_arg)?;
            seed_urls.extend(
                content
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty()),
            );
        } else {
            seed_urls.extend(seeds_arg.split(',').map(|s| s.trim().to_string()));
        }
    }

    let mut seeded = 0usize;
    for url in &seed_urls {
        match CrawlUrl::new(url, &config.crawl.job_id) {
            Ok(rec) => {
                let priority = rec.priority;
                queues
                    .push(QueueName::Frontier, QueuePayload::Crawl(rec), priority, Utc::now())
                    .await
                    .map_err(|e| anyhow::anyhow!("seeding frontier: {e}"))?;
                seeded += 1;
            }
            Err(e) => warn!(%url, "skipping seed: {e}"),
        }
    }
    info!(seeded, "seeds loaded");

    supervisor.start().await;

    let watch = CancellationToken::new();
    if until_idle {
        tokio::select! {
            _ = signal::ctrl_c() => info!("shutdown signal received"),
            idle = supervisor.wait_until_idle(&watch) => {
                if idle {
                    info!("all queues drained");
                }
            }
        }
    } else {
        info!("press Ctrl+C to stop crawling");
        signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    supervisor.stop().await;

    for queue in QueueName::ALL {
        if let Ok(size) = queues.size(queue).await {
            info!(queue = queue.as_str(), size, "final queue size");
        }
    }
    info!("shutdown complete");
    Ok(())
}

pub async fn run_status(config: AppConfig) -> Result<()> {
    let queues = build_queue(&config).await?;
    for queue in QueueName::ALL {
        let size = queues
            .size(queue)
            .await
            .map_err(|e| anyhow::anyhow!("queue size: {e}"))?;
        let age = queues
            .oldest_age(queue)
            .await
            .ok()
            .flatten()
            .map(|a| format!("{}s", a.as_secs()))
            .unwrap_or_else(|| "-".into());
        println!("{:>10}  {:>8} records   oldest {age}", queue.as_str(), size);
    }
    Ok(())
}
