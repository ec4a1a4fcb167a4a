//! Parse worker: read the stored body, extract links and fields, feed the
//! catalog and the frontier. Never touches the network.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use trawler_core::{CrawlUrl, ParseItem};
use trawler_queue::{Leased, NackOutcome, QueueError, QueueName, QueuePayload};

use crate::WorkerContext;

pub async fn run(
    worker_id: usize,
    ctx: WorkerContext,
    lease_ctx: CancellationToken,
    shutdown: CancellationToken,
) {
    info!(worker_id, "parse worker started");
    loop {
        let leased = match ctx.queues.lease(QueueName::Parse, &lease_ctx).await {
            Ok(leased) => leased,
            Err(QueueError::Canceled) => break,
            Err(e) => {
                warn!(worker_id, "parse lease failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let timed_out = tokio::time::timeout(
            ctx.handler_timeout(),
            handle_item(worker_id, &ctx, leased),
        )
        .await
        .is_err();
        if timed_out {
            warn!(worker_id, "parse handler exceeded its budget");
        }
        if shutdown.is_cancelled() {
            break;
        }
    }
    info!(worker_id, "parse worker stopped");
}

async fn handle_item(worker_id: usize, ctx: &WorkerContext, leased: Leased) {
    let token = leased.token;
    let Some(item) = leased.record.payload.as_parse().cloned() else {
        warn!(worker_id, "non-parse payload on parse queue, dropping");
        ack_or_log(ctx, &token).await;
        return;
    };
    let delivery_count = leased.record.delivery_count;

    let body = match ctx.blobs.read(&item.content_ref).await {
        Ok(body) => body,
        Err(e) => {
            // blob may be on its way to durable storage; worth a retry
            let delay = ctx.retry_delay(delivery_count + 1, None);
            warn!(worker_id, content_ref = %item.content_ref, "blob read failed: {e}");
            nack_or_log(ctx, &token, delay, Some(e.to_string())).await;
            return;
        }
    };

    let base = match Url::parse(&item.final_url).or_else(|_| Url::parse(&item.url)) {
        Ok(u) => u,
        Err(e) => {
            warn!(worker_id, url = %item.url, "unparseable parse item url: {e}");
            record_failure(ctx, &item, &format!("bad url: {e}")).await;
            ack_or_log(ctx, &token).await;
            return;
        }
    };

    let extracted = match ctx.parser.parse(&body, &base) {
        Ok(extracted) => extracted,
        Err(failure) if failure.permanent => {
            debug!(worker_id, url = %item.url, "permanent parse failure: {failure}");
            record_failure(ctx, &item, &failure.reason).await;
            ack_or_log(ctx, &token).await;
            return;
        }
        Err(failure) => {
            let delay = ctx.retry_delay(delivery_count + 1, None);
            warn!(worker_id, url = %item.url, "transient parse failure: {failure}");
            nack_or_log(ctx, &token, delay, Some(failure.reason)).await;
            return;
        }
    };

    if let Err(e) = ctx.catalog.record_extract(&item.fingerprint, &extracted).await {
        let delay = ctx.retry_delay(delivery_count + 1, None);
        warn!(worker_id, url = %item.url, "record_extract failed: {e}");
        nack_or_log(ctx, &token, delay, Some(e.to_string())).await;
        return;
    }

    // discovered links re-enter the frontier one level deeper
    if item.depth < ctx.crawl.max_depth {
        let mut enqueued = 0usize;
        for link in &extracted.links {
            match CrawlUrl::new(link, &item.job_id) {
                Ok(mut child) => {
                    child.depth = item.depth + 1;
                    child.discovered_from = Some(item.fingerprint.clone());
                    let priority = child.priority;
                    if let Err(e) = ctx
                        .queues
                        .push(
                            QueueName::Frontier,
                            QueuePayload::Crawl(child),
                            priority,
                            Utc::now(),
                        )
                        .await
                    {
                        warn!(worker_id, %link, "frontier push failed: {e}");
                    } else {
                        enqueued += 1;
                    }
                }
                Err(e) => debug!(worker_id, %link, "skipping discovered url: {e}"),
            }
        }
        if enqueued > 0 {
            debug!(worker_id, url = %item.url, enqueued, "links enqueued");
        }
    }

    ack_or_log(ctx, &token).await;
}

async fn record_failure(ctx: &WorkerContext, item: &ParseItem, reason: &str) {
    if let Err(e) = ctx.catalog.record_failure(&item.fingerprint, reason).await {
        warn!(url = %item.url, "record_failure failed: {e}");
    }
}

async fn ack_or_log(ctx: &WorkerContext, token: &trawler_queue::LeaseToken) {
    if let Err(e) = ctx.queues.ack(QueueName::Parse, token).await {
        warn!("parse ack failed: {e}");
    }
}

async fn nack_or_log(
    ctx: &WorkerContext,
    token: &trawler_queue::LeaseToken,
    delay: Duration,
    last_error: Option<String>,
) {
    match ctx.queues.nack(QueueName::Parse, token, delay, last_error).await {
        Ok(NackOutcome::DeadLettered) => {
            info!("parse item promoted to dead letter queue");
        }
        Ok(NackOutcome::Requeued { .. }) => {}
        Err(e) => warn!("parse nack failed: {e}"),
    }
}
