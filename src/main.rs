mod cli;
mod crawl;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

// mimalloc keeps memory flat with many concurrent workers; glibc malloc
// holds on to freed pages under this workload
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use trawler_core::AppConfig;

use crate::cli::{Cli, Commands};
use crate::crawl::{run_crawl, run_status};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;

    // environment overrides for the knobs that change per deployment
    if let Ok(v) = std::env::var("TRAWLER_CRAWL_WORKERS") {
        if let Ok(n) = v.parse::<usize>() {
            if n >= 1 {
                config.workers.num_crawl_workers = n;
            }
        }
    }
    if let Ok(v) = std::env::var("TRAWLER_PARSE_WORKERS") {
        if let Ok(n) = v.parse::<usize>() {
            if n >= 1 {
                config.workers.num_parse_workers = n;
            }
        }
    }
    if let Ok(v) = std::env::var("TRAWLER_MAX_DEPTH") {
        if let Ok(n) = v.parse::<u32>() {
            config.crawl.max_depth = n;
        }
    }
    if let Ok(v) = std::env::var("TRAWLER_QUEUE_BACKEND") {
        config.queue.backend = v;
    }
    if let Ok(v) = std::env::var("TRAWLER_REDIS_URL") {
        config.queue.redis_url = v;
    }

    match cli.command {
        Commands::Crawl {
            seeds,
            seed,
            depth,
            until_idle,
        } => {
            run_crawl(config, seeds, seed, depth, until_idle).await?;
        }
        Commands::Status => {
            run_status(config).await?;
        }
    }

    Ok(())
}
