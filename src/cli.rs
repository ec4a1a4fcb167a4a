use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trawler", about = "Distributed web-crawl frontier & worker-pool engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start crawling from seed URLs
    Crawl {
        /// Seed URLs (comma-separated or file path)
        #[arg(short, long)]
        seeds: Option<String>,

        /// Single seed URL
        #[arg(long)]
        seed: Option<String>,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Exit once every queue is drained instead of waiting for Ctrl+C
        #[arg(long)]
        until_idle: bool,
    },
    /// Show queue sizes for the configured backend
    Status,
}
