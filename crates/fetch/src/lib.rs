//! The fetch pipeline: token-bucket rate limiting, DNS and robots caches,
//! the streaming HTTP fetcher and the headless-render pool. Everything here
//! takes an explicit cancellation token; suspension points unwind with
//! `CrawlError::Canceled` on shutdown.

pub mod dns;
pub mod fetcher;
pub mod rate_limit;
pub mod render;
pub mod robots;

pub use dns::{DnsCache, HickoryResolver, Resolve};
pub use fetcher::Fetcher;
pub use rate_limit::RateLimiter;
pub use render::{ChromiumRenderer, PageRenderer, RenderPool, WaitSpec};
pub use robots::RobotsCache;
