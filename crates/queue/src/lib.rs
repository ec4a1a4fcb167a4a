//! Queue manager: four named queues (frontier, parse, retry, dead) with
//! priority ordering, at-least-once delivery and visibility timeouts.
//!
//! Backends implement [`QueueBackend`]; the in-memory backend serves
//! single-process runs and tests, the redis backend survives restarts.

pub mod backoff;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use trawler_core::{CrawlUrl, ParseItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Frontier,
    Parse,
    Retry,
    Dead,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Frontier,
        QueueName::Parse,
        QueueName::Retry,
        QueueName::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frontier => "frontier",
            Self::Parse => "parse",
            Self::Retry => "retry",
            Self::Dead => "dead",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Frontier => 0,
            Self::Parse => 1,
            Self::Retry => 2,
            Self::Dead => 3,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a queue carries. The `kind` tag keeps the wire shape stable for the
/// durable backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    Crawl(CrawlUrl),
    Parse(ParseItem),
}

impl QueuePayload {
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Crawl(c) => &c.fingerprint,
            Self::Parse(p) => &p.fingerprint,
        }
    }

    pub fn as_crawl(&self) -> Option<&CrawlUrl> {
        match self {
            Self::Crawl(c) => Some(c),
            Self::Parse(_) => None,
        }
    }

    pub fn as_parse(&self) -> Option<&ParseItem> {
        match self {
            Self::Parse(p) => Some(p),
            Self::Crawl(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub payload: QueuePayload,
    pub priority: u8,
    pub push_seq: u64,
    pub visible_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub pushed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Opaque handle for ack/nack. Tokens from an expired lease are rejected, so
/// a slow worker cannot ack a record that was already re-leased elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(pub(crate) String);

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct Leased {
    pub record: QueueRecord,
    pub token: LeaseToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { visible_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("canceled")]
    Canceled,

    /// Backend I/O failed past the internal retry budget. Callers treat this
    /// as transient.
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    /// The lease token does not match a live lease (expired, double ack).
    #[error("unknown or expired lease: {0}")]
    UnknownLease(String),

    #[error("record serialization: {0}")]
    Serde(String),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

/// The queue capability. All operations are safe for concurrent use.
///
/// Delivery contract: at-least-once. A leased record whose lease expires
/// without ack is eventually re-leased; consumers must be idempotent.
/// Ordering: strict priority, FIFO by push order within a priority; no
/// ordering across priorities or queues.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Durable enqueue, hidden until `visible_at`. A push whose fingerprint
    /// is already resident with an earlier-or-equal `visible_at` may be
    /// dropped (coalescing).
    async fn push(
        &self,
        queue: QueueName,
        payload: QueuePayload,
        priority: u8,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Blocks until a record is available or `ctx` is canceled. The record
    /// becomes invisible for the configured visibility timeout.
    async fn lease(&self, queue: QueueName, ctx: &CancellationToken) -> Result<Leased, QueueError>;

    /// Non-blocking variant of [`lease`](Self::lease).
    async fn try_lease(&self, queue: QueueName) -> Result<Option<Leased>, QueueError>;

    /// Permanent removal of a leased record.
    async fn ack(&self, queue: QueueName, token: &LeaseToken) -> Result<(), QueueError>;

    /// Return a leased record to the queue, visible again at `now + delay`.
    /// Increments `delivery_count`; crossing `max_retries` moves the record
    /// to the dead queue instead, with `last_error` attached.
    async fn nack(
        &self,
        queue: QueueName,
        token: &LeaseToken,
        delay: Duration,
        last_error: Option<String>,
    ) -> Result<NackOutcome, QueueError>;

    /// Best-effort count of resident records (visible, delayed and leased).
    async fn size(&self, queue: QueueName) -> Result<u64, QueueError>;

    /// Age of the oldest resident record, if any. Best-effort.
    async fn oldest_age(&self, queue: QueueName) -> Result<Option<Duration>, QueueError>;

    /// Drop everything in the queue. Admin only.
    async fn clear(&self, queue: QueueName) -> Result<(), QueueError>;
}

/// How long a blocked `lease` sleeps between polls when nothing is visible.
pub(crate) const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);
