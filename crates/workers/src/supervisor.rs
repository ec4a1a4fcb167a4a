//! Supervisor: owns the caches, the render pool, the queue capability and
//! both worker pools. Workers are supervised tasks, not futures the caller
//! juggles; scaling and shutdown go through here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trawler_queue::QueueName;

use crate::{crawl_worker, parse_worker, WorkerContext};

const METRICS_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Crawl,
    Parse,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Parse => "parse",
        }
    }
}

struct WorkerHandle {
    lease_ctx: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    ctx: WorkerContext,
    shutdown: CancellationToken,
    crawl_pool: Mutex<Vec<WorkerHandle>>,
    parse_pool: Mutex<Vec<WorkerHandle>>,
    /// Scaled-down workers finishing their current record.
    draining: Mutex<Vec<JoinHandle<()>>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl Supervisor {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            shutdown: CancellationToken::new(),
            crawl_pool: Mutex::new(Vec::new()),
            parse_pool: Mutex::new(Vec::new()),
            draining: Mutex::new(Vec::new()),
            metrics_task: Mutex::new(None),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub async fn start(&self) {
        let crawl = self.ctx.workers.num_crawl_workers;
        let parse = self.ctx.workers.num_parse_workers;
        info!(crawl, parse, "starting worker pools");
        self.scale(WorkerRole::Crawl, crawl).await;
        self.scale(WorkerRole::Parse, parse).await;

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(METRICS_INTERVAL) => {}
                }
                for queue in QueueName::ALL {
                    if let Ok(size) = ctx.queues.size(queue).await {
                        metrics::gauge!("queue_size", "queue" => queue.as_str())
                            .set(size as f64);
                    }
                    if let Ok(age) = ctx.queues.oldest_age(queue).await {
                        metrics::gauge!("queue_oldest_age_seconds", "queue" => queue.as_str())
                            .set(age.map(|a| a.as_secs_f64()).unwrap_or(0.0));
                    }
                }
            }
        });
        *self.metrics_task.lock().await = Some(task);
    }

    /// Adjust a pool to `n` workers. Growing spawns immediately; shrinking
    /// stops leasing on the excess workers and lets their in-flight record
    /// finish.
    pub async fn scale(&self, role: WorkerRole, n: usize) {
        let pool = match role {
            WorkerRole::Crawl => &self.crawl_pool,
            WorkerRole::Parse => &self.parse_pool,
        };
        let mut pool = pool.lock().await;
        while pool.len() < n {
            pool.push(self.spawn(role));
        }
        if pool.len() > n {
            debug!(role = role.as_str(), from = pool.len(), to = n, "draining excess workers");
        }
        while pool.len() > n {
            if let Some(worker) = pool.pop() {
                worker.lease_ctx.cancel();
                self.draining.lock().await.push(worker.handle);
            }
        }
        metrics::gauge!("worker_state", "role" => role.as_str()).set(pool.len() as f64);
    }

    fn spawn(&self, role: WorkerRole) -> WorkerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lease_ctx = self.shutdown.child_token();
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        let worker_lease_ctx = lease_ctx.clone();
        let handle = tokio::spawn(async move {
            match role {
                WorkerRole::Crawl => {
                    crawl_worker::run(id, ctx, worker_lease_ctx, shutdown).await
                }
                WorkerRole::Parse => {
                    parse_worker::run(id, ctx, worker_lease_ctx, shutdown).await
                }
            }
        });
        WorkerHandle { lease_ctx, handle }
    }

    /// All queues drained and nothing in flight. Sampled twice to dodge the
    /// instant between an ack and the push it triggered.
    pub async fn idle(&self) -> bool {
        for _ in 0..2 {
            for queue in [QueueName::Frontier, QueueName::Parse, QueueName::Retry] {
                match self.ctx.queues.size(queue).await {
                    Ok(0) => {}
                    _ => return false,
                }
            }
            if !self.ctx.inflight.is_empty() {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }

    /// Blocks until the crawl drains or `ctx` cancels. Returns true on idle.
    pub async fn wait_until_idle(&self, ctx: &CancellationToken) -> bool {
        loop {
            if ctx.is_cancelled() {
                return false;
            }
            if self.idle().await {
                return true;
            }
            tokio::select! {
                _ = ctx.cancelled() => return false,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    /// Cancel everything, then give in-flight handlers `shutdown_grace` to
    /// reach an ack or nack; stragglers are aborted and their records return
    /// via lease expiry.
    pub async fn stop(&self) {
        info!("supervisor stopping");
        self.shutdown.cancel();

        let grace = Duration::from_secs(self.ctx.workers.shutdown_grace_seconds);
        let deadline = Instant::now() + grace;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.extend(self.crawl_pool.lock().await.drain(..).map(|w| w.handle));
        handles.extend(self.parse_pool.lock().await.drain(..).map(|w| w.handle));
        handles.extend(self.draining.lock().await.drain(..));
        if let Some(task) = self.metrics_task.lock().await.take() {
            task.abort();
        }

        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("worker did not stop within grace period, aborting");
                handle.abort();
            }
        }

        metrics::gauge!("worker_state", "role" => "crawl").set(0.0);
        metrics::gauge!("worker_state", "role" => "parse").set(0.0);
        info!("supervisor stopped");
    }

    pub async fn worker_count(&self, role: WorkerRole) -> usize {
        match role {
            WorkerRole::Crawl => self.crawl_pool.lock().await.len(),
            WorkerRole::Parse => self.parse_pool.lock().await.len(),
        }
    }
}
