//! Crawl worker: lease a frontier record, run it through admission
//! (in-flight index, robots, rate, DNS), fetch or render, and finish with
//! exactly one ack or nack. One bad URL never kills the loop.

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use trawler_core::{CrawlError, CrawlUrl, FetchOutcome, FetchResult, ParseItem};
use trawler_fetch::{Fetcher, WaitSpec};
use trawler_queue::{Leased, NackOutcome, QueueError, QueueName, QueuePayload};
use trawler_storage::CrawlMeta;

use crate::WorkerContext;

/// Settle budget handed to the renderer when a record carries no wait hint.
const RENDER_SETTLE: Duration = Duration::from_secs(2);

/// How often a backpressure-paused worker re-checks the parse queue.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(500);

/// Long-lived worker loop. `lease_ctx` stops new leases (scale-down);
/// `shutdown` aborts in-flight suspension points (global stop).
pub async fn run(
    worker_id: usize,
    ctx: WorkerContext,
    lease_ctx: CancellationToken,
    shutdown: CancellationToken,
) {
    info!(worker_id, "crawl worker started");
    loop {
        if backpressure_gate(&ctx, &lease_ctx).await.is_err() {
            break;
        }
        let leased = match ctx.queues.lease(QueueName::Frontier, &lease_ctx).await {
            Ok(leased) => leased,
            Err(QueueError::Canceled) => break,
            Err(e) => {
                warn!(worker_id, "frontier lease failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // the handler is bounded; an overrun drops the future and the lease
        // expiry brings the record back
        let timed_out = tokio::time::timeout(
            ctx.handler_timeout(),
            handle_record(worker_id, &ctx, leased, &shutdown),
        )
        .await
        .is_err();
        if timed_out {
            warn!(worker_id, "handler exceeded its budget, record returns via lease expiry");
        }
        if shutdown.is_cancelled() {
            break;
        }
    }
    info!(worker_id, "crawl worker stopped");
}

/// Pause leasing while the parse queue is above the high-water mark; resume
/// once it drains below the low-water mark.
async fn backpressure_gate(ctx: &WorkerContext, lease_ctx: &CancellationToken) -> Result<(), ()> {
    let size = ctx
        .queues
        .size(QueueName::Parse)
        .await
        .unwrap_or_default();
    if size <= ctx.workers.parse_hwm {
        return Ok(());
    }
    debug!(size, hwm = ctx.workers.parse_hwm, "parse backlog high, pausing crawl leases");
    loop {
        tokio::select! {
            _ = lease_ctx.cancelled() => return Err(()),
            _ = tokio::time::sleep(BACKPRESSURE_POLL) => {}
        }
        let size = ctx
            .queues
            .size(QueueName::Parse)
            .await
            .unwrap_or_default();
        if size <= ctx.workers.parse_lwm {
            return Ok(());
        }
    }
}

async fn handle_record(
    worker_id: usize,
    ctx: &WorkerContext,
    leased: Leased,
    shutdown: &CancellationToken,
) {
    let token = leased.token;
    let Some(rec) = leased.record.payload.as_crawl().cloned() else {
        warn!(worker_id, "non-crawl payload on frontier, dropping");
        ack_or_log(ctx, QueueName::Frontier, &token).await;
        return;
    };
    let delivery_count = leased.record.delivery_count;

    // not yet dispatchable: push the residual delay back
    if let Some(next_available_at) = rec.next_available_at {
        let now = Utc::now();
        if now < next_available_at {
            let delay = (next_available_at - now).to_std().unwrap_or_default();
            if let Err(e) = ctx
                .queues
                .nack(QueueName::Frontier, &token, delay, None)
                .await
            {
                warn!(worker_id, "nack failed: {e}");
            }
            return;
        }
    }

    // someone else is already on this URL for this job
    let Some(_guard) = ctx.inflight.admit(&rec.job_id, &rec.fingerprint) else {
        debug!(worker_id, url = %rec.url, "already in flight, dropping duplicate");
        ack_or_log(ctx, QueueName::Frontier, &token).await;
        return;
    };

    let url = match Url::parse(&rec.url) {
        Ok(u) => u,
        Err(e) => {
            warn!(worker_id, url = %rec.url, "unparseable frontier url: {e}");
            record_failure(ctx, &rec, &format!("bad url: {e}")).await;
            ack_or_log(ctx, QueueName::Frontier, &token).await;
            return;
        }
    };

    match crawl_once(worker_id, ctx, &rec, &url, shutdown).await {
        Ok(result) => {
            finish(worker_id, ctx, &rec, delivery_count, result, &token).await;
        }
        Err(CrawlError::Canceled) => {
            // no ack, no nack; lease expiry hands the record to another worker
            debug!(worker_id, url = %rec.url, "canceled mid-record");
        }
        Err(CrawlError::RobotsDenied) => {
            info!(worker_id, url = %rec.url, "blocked by robots.txt");
            metrics::counter!("fetch_outcome_total", "outcome" => "blocked_robots").increment(1);
            record_failure(ctx, &rec, "blocked_robots").await;
            ack_or_log(ctx, QueueName::Frontier, &token).await;
        }
        Err(e) => {
            // unexpected failures in the middle of the protocol are transient
            let attempts = delivery_count + 1;
            let delay = ctx.retry_delay(attempts, e.retry_after());
            warn!(worker_id, url = %rec.url, ?delay, "transient failure: {e}");
            metrics::counter!("fetch_outcome_total", "outcome" => "error_transient").increment(1);
            nack_or_log(ctx, QueueName::Frontier, &token, delay, Some(e.to_string())).await;
        }
    }
}

/// Steps 3-6 of the per-record protocol: robots, rate, DNS, fetch/render.
async fn crawl_once(
    worker_id: usize,
    ctx: &WorkerContext,
    rec: &CrawlUrl,
    url: &Url,
    shutdown: &CancellationToken,
) -> Result<FetchResult, CrawlError> {
    if !ctx.robots.allowed(url, shutdown).await? {
        return Err(CrawlError::RobotsDenied);
    }

    let domain = rec.domain();
    ctx.rate.acquire(&domain, shutdown).await?;

    // warm the cache; IP-literal hosts have nothing to resolve
    if let Some(host) = url.host_str() {
        if host.parse::<IpAddr>().is_err() {
            ctx.dns.resolve(host, shutdown).await?;
        }
    }

    if Fetcher::needs_render(rec) {
        if let Some(pool) = &ctx.render {
            debug!(worker_id, url = %rec.url, "dispatching to renderer");
            return pool
                .render(rec, &WaitSpec::Budget(RENDER_SETTLE), ctx.blobs.as_ref(), shutdown)
                .await;
        }
    }
    ctx.fetcher.fetch(rec, ctx.blobs.as_ref(), shutdown).await
}

/// Step 7: interpret the fetch result into exactly one ack or nack.
async fn finish(
    worker_id: usize,
    ctx: &WorkerContext,
    rec: &CrawlUrl,
    delivery_count: u32,
    result: FetchResult,
    token: &trawler_queue::LeaseToken,
) {
    match result.outcome {
        FetchOutcome::Ok => {
            metrics::counter!("fetch_outcome_total", "outcome" => "ok").increment(1);
            let Some(content_ref) = result.content_ref.clone() else {
                warn!(worker_id, url = %rec.url, "ok fetch without content_ref");
                ack_or_log(ctx, QueueName::Frontier, token).await;
                return;
            };
            let item = ParseItem {
                content_ref,
                url: rec.url.clone(),
                final_url: result.final_url.clone(),
                fingerprint: rec.fingerprint.clone(),
                job_id: rec.job_id.clone(),
                status: result.status.unwrap_or(200),
                headers: result.headers.clone(),
                fetched_at: result.fetched_at,
                depth: rec.depth,
                size: result.size,
                content_type: result.headers.get("content-type").cloned(),
            };
            if let Err(e) = ctx
                .queues
                .push(
                    QueueName::Parse,
                    QueuePayload::Parse(item),
                    rec.priority,
                    Utc::now(),
                )
                .await
            {
                // leave the record unacked; redelivery re-creates the item
                warn!(worker_id, url = %rec.url, "parse push failed: {e}");
                return;
            }
            record_crawl(ctx, rec, &result).await;
            if result.etag.is_some() || result.last_modified.is_some() {
                if let Err(e) = ctx
                    .catalog
                    .update_validators(
                        &rec.fingerprint,
                        result.etag.as_deref(),
                        result.last_modified.as_deref(),
                    )
                    .await
                {
                    warn!(worker_id, "update_validators failed: {e}");
                }
            }
            ack_or_log(ctx, QueueName::Frontier, token).await;
        }
        FetchOutcome::NotModified => {
            metrics::counter!("fetch_outcome_total", "outcome" => "not_modified").increment(1);
            record_crawl(ctx, rec, &result).await;
            ack_or_log(ctx, QueueName::Frontier, token).await;
        }
        FetchOutcome::SkippedTooLarge => {
            metrics::counter!("fetch_outcome_total", "outcome" => "skipped_too_large")
                .increment(1);
            info!(worker_id, url = %rec.url, size = result.size, "body over size cap, skipped");
            record_failure(ctx, rec, "skipped_too_large").await;
            ack_or_log(ctx, QueueName::Frontier, token).await;
        }
        FetchOutcome::BlockedRobots | FetchOutcome::BlockedRate => {
            metrics::counter!("fetch_outcome_total", "outcome" => result.outcome.as_str())
                .increment(1);
            record_failure(ctx, rec, result.outcome.as_str()).await;
            ack_or_log(ctx, QueueName::Frontier, token).await;
        }
        FetchOutcome::Error => {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown fetch error".into());
            if result.retryable {
                metrics::counter!("fetch_outcome_total", "outcome" => "error_transient")
                    .increment(1);
                let attempts = delivery_count + 1;
                let delay = ctx.retry_delay(attempts, result.retry_after);
                debug!(worker_id, url = %rec.url, ?delay, "retrying: {reason}");
                nack_or_log(ctx, QueueName::Frontier, token, delay, Some(reason)).await;
            } else {
                // permanent: write the failure marker and never re-enqueue
                metrics::counter!("fetch_outcome_total", "outcome" => "error_permanent")
                    .increment(1);
                info!(worker_id, url = %rec.url, "permanent failure: {reason}");
                record_failure(ctx, rec, &reason).await;
                ack_or_log(ctx, QueueName::Frontier, token).await;
            }
        }
    }
}

async fn record_crawl(ctx: &WorkerContext, rec: &CrawlUrl, result: &FetchResult) {
    let meta = CrawlMeta {
        job_id: rec.job_id.clone(),
        url: rec.url.clone(),
        final_url: if result.final_url.is_empty() {
            rec.url.clone()
        } else {
            result.final_url.clone()
        },
        status: result.status.unwrap_or_default(),
        content_type: result.headers.get("content-type").cloned(),
        size: result.size,
        depth: rec.depth,
        fetched_at: result.fetched_at,
    };
    if let Err(e) = ctx.catalog.record_crawl(&rec.fingerprint, &meta).await {
        warn!(url = %rec.url, "record_crawl failed: {e}");
    }
}

async fn record_failure(ctx: &WorkerContext, rec: &CrawlUrl, reason: &str) {
    if let Err(e) = ctx.catalog.record_failure(&rec.fingerprint, reason).await {
        warn!(url = %rec.url, "record_failure failed: {e}");
    }
}

async fn ack_or_log(ctx: &WorkerContext, queue: QueueName, token: &trawler_queue::LeaseToken) {
    if let Err(e) = ctx.queues.ack(queue, token).await {
        warn!(queue = %queue, "ack failed: {e}");
    }
}

async fn nack_or_log(
    ctx: &WorkerContext,
    queue: QueueName,
    token: &trawler_queue::LeaseToken,
    delay: Duration,
    last_error: Option<String>,
) {
    match ctx.queues.nack(queue, token, delay, last_error).await {
        Ok(NackOutcome::DeadLettered) => {
            info!(queue = %queue, "record promoted to dead letter queue");
        }
        Ok(NackOutcome::Requeued { .. }) => {}
        Err(e) => warn!(queue = %queue, "nack failed: {e}"),
    }
}
