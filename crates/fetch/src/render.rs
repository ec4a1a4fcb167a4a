//! Headless-render capability. The pool bounds concurrent renders with a
//! semaphore; the browser itself sits behind [`PageRenderer`] so tests can
//! swap in a canned implementation. Rendered HTML lands in the blob store
//! with a synthesized 200/text-html result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trawler_core::{CrawlError, CrawlUrl, FetchOutcome, FetchResult};
use trawler_storage::BlobStore;

/// What to wait for before snapshotting the DOM: a CSS selector that must
/// appear, or a fixed settle budget.
#[derive(Debug, Clone)]
pub enum WaitSpec {
    Selector(String),
    Budget(Duration),
}

#[async_trait]
pub trait PageRenderer: Send + Sync + 'static {
    /// Navigate, wait per `wait`, return the rendered HTML. `timeout` bounds
    /// the whole operation.
    async fn render(
        &self,
        url: &str,
        wait: &WaitSpec,
        timeout: Duration,
    ) -> Result<String, CrawlError>;
}

pub struct RenderPool {
    renderer: Arc<dyn PageRenderer>,
    slots: Arc<tokio::sync::Semaphore>,
    pool_size: usize,
    page_timeout: Duration,
}

impl RenderPool {
    pub fn new(renderer: Arc<dyn PageRenderer>, pool_size: usize, page_timeout: Duration) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            renderer,
            slots: Arc::new(tokio::sync::Semaphore::new(pool_size)),
            pool_size,
            page_timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.pool_size - self.slots.available_permits()
    }

    /// Render a frontier record. Blocks for a pool slot until `ctx` cancels;
    /// the permit is scoped, so a panicking render still releases it.
    pub async fn render(
        &self,
        rec: &CrawlUrl,
        wait: &WaitSpec,
        blobs: &dyn BlobStore,
        ctx: &CancellationToken,
    ) -> Result<FetchResult, CrawlError> {
        let permit = tokio::select! {
            _ = ctx.cancelled() => return Err(CrawlError::Canceled),
            p = self.slots.acquire() => p.map_err(|e| CrawlError::Renderer(e.to_string()))?,
        };
        metrics::gauge!("render_in_use").set(self.in_use() as f64);
        metrics::gauge!("render_available").set(self.available() as f64);

        let rendered = tokio::select! {
            _ = ctx.cancelled() => {
                drop(permit);
                return Err(CrawlError::Canceled);
            }
            r = tokio::time::timeout(
                self.page_timeout,
                self.renderer.render(&rec.url, wait, self.page_timeout),
            ) => r,
        };
        drop(permit);
        metrics::gauge!("render_in_use").set(self.in_use() as f64);
        metrics::gauge!("render_available").set(self.available() as f64);

        let html = match rendered {
            Err(_) => {
                return Ok(FetchResult::error(
                    None,
                    format!("render timed out after {:?}", self.page_timeout),
                    true,
                ))
            }
            Ok(Err(e)) => return Ok(FetchResult::error(None, format!("render: {e}"), true)),
            Ok(Ok(html)) => html,
        };

        let mut writer = blobs.open_writer(&rec.job_id, &rec.fingerprint).await?;
        if let Err(e) = writer.write_chunk(html.as_bytes()).await {
            let _ = writer.discard().await;
            return Err(e);
        }
        let content_ref = writer.close().await?;

        let mut headers = HashMap::new();
        headers.insert("content-type".to_owned(), "text/html".to_owned());
        Ok(FetchResult {
            outcome: FetchOutcome::Ok,
            status: Some(200),
            headers,
            final_url: rec.url.clone(),
            content_ref: Some(content_ref),
            size: html.len() as u64,
            etag: None,
            last_modified: None,
            fetched_at: Utc::now(),
            error: None,
            retryable: false,
            retry_after: None,
        })
    }
}

/// chromiumoxide-backed renderer: one browser process, one fresh page per
/// render.
pub struct ChromiumRenderer {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl ChromiumRenderer {
    pub async fn launch() -> Result<Self, CrawlError> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(CrawlError::Renderer)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::Renderer(e.to_string()))?;
        // the handler stream must be driven for the browser to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {e}");
                }
            }
        });
        Ok(Self {
            browser,
            handler_task,
        })
    }
}

impl Drop for ChromiumRenderer {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(
        &self,
        url: &str,
        wait: &WaitSpec,
        timeout: Duration,
    ) -> Result<String, CrawlError> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| CrawlError::Renderer(e.to_string()))?;
        if let Err(e) = page.wait_for_navigation().await {
            warn!(url, "navigation wait failed: {e}");
        }

        match wait {
            WaitSpec::Budget(budget) => {
                tokio::time::sleep((*budget).min(timeout)).await;
            }
            WaitSpec::Selector(selector) => {
                // poll until the selector appears or the budget runs out
                let deadline = Instant::now() + timeout;
                loop {
                    if page.find_element(selector.as_str()).await.is_ok() {
                        break;
                    }
                    if Instant::now() >= deadline {
                        debug!(url, %selector, "selector never appeared, snapshotting anyway");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        let html = page
            .content()
            .await
            .map_err(|e| CrawlError::Renderer(e.to_string()))?;
        if let Err(e) = page.close().await {
            debug!(url, "page close failed: {e}");
        }
        Ok(html)
    }
}
