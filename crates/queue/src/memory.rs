//! In-memory backend for single-process runs and tests. One monitor guards
//! all four queues so dead-letter promotion is a single critical section.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    Leased, LeaseToken, NackOutcome, QueueBackend, QueueError, QueueName, QueuePayload,
    QueueRecord, QueueSettings, LEASE_POLL_INTERVAL,
};

/// Heap rank: higher priority first, then FIFO by push sequence.
type ReadyRank = (u8, Reverse<u64>);

struct Lease {
    nonce: u64,
    expires_ms: i64,
}

#[derive(Default)]
struct QueueState {
    ready: PriorityQueue<u64, ReadyRank>,
    /// (visible_at_ms, id) for records not yet visible.
    delayed: BTreeMap<(i64, u64), ()>,
    leased: HashMap<u64, Lease>,
    /// (expires_ms, id) mirror of `leased` for cheap expiry sweeps.
    lease_expiry: BTreeMap<(i64, u64), ()>,
    records: HashMap<u64, QueueRecord>,
    /// Fingerprint -> resident (not leased) record id, for coalescing.
    by_fingerprint: HashMap<String, u64>,
}

impl QueueState {
    fn rank(rec: &QueueRecord) -> ReadyRank {
        (rec.priority, Reverse(rec.push_seq))
    }

    /// Promote due delayed records and reclaim expired leases.
    fn promote(&mut self, now_ms: i64) {
        loop {
            let Some((&(vis_ms, id), _)) = self.delayed.first_key_value() else {
                break;
            };
            if vis_ms > now_ms {
                break;
            }
            self.delayed.remove(&(vis_ms, id));
            if let Some(rec) = self.records.get(&id) {
                self.ready.push(id, Self::rank(rec));
            }
        }
        loop {
            let Some((&(exp_ms, id), _)) = self.lease_expiry.first_key_value() else {
                break;
            };
            if exp_ms > now_ms {
                break;
            }
            self.lease_expiry.remove(&(exp_ms, id));
            self.leased.remove(&id);
            if let Some(rec) = self.records.get(&id) {
                self.ready.push(id, Self::rank(rec));
                self.by_fingerprint
                    .entry(rec.payload.fingerprint().to_owned())
                    .or_insert(id);
            }
        }
    }

    fn insert(&mut self, id: u64, rec: QueueRecord, now_ms: i64) {
        let vis_ms = rec.visible_at.timestamp_millis();
        self.by_fingerprint
            .insert(rec.payload.fingerprint().to_owned(), id);
        if vis_ms <= now_ms {
            self.ready.push(id, Self::rank(&rec));
        } else {
            self.delayed.insert((vis_ms, id), ());
        }
        self.records.insert(id, rec);
    }
}

pub struct InMemoryQueue {
    states: Mutex<[QueueState; 4]>,
    notify: [Notify; 4],
    seq: AtomicU64,
    nonce: AtomicU64,
    settings: QueueSettings,
}

impl InMemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            states: Mutex::new(Default::default()),
            notify: Default::default(),
            seq: AtomicU64::new(1),
            nonce: AtomicU64::new(1),
            settings,
        }
    }

    fn parse_token(token: &LeaseToken) -> Result<(u64, u64), QueueError> {
        let mut parts = token.0.split(':');
        let id = parts.nth(1).and_then(|s| s.parse().ok());
        let nonce = parts.next().and_then(|s| s.parse().ok());
        match (id, nonce) {
            (Some(id), Some(nonce)) => Ok((id, nonce)),
            _ => Err(QueueError::UnknownLease(token.0.clone())),
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn push(
        &self,
        queue: QueueName,
        payload: QueuePayload,
        priority: u8,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut states = self.states.lock().await;
        let state = &mut states[queue.index()];

        // Coalesce: a resident record for the same fingerprint that becomes
        // visible no later than the incoming one makes the push a no-op.
        if let Some(&resident) = state.by_fingerprint.get(payload.fingerprint()) {
            if let Some(existing) = state.records.get(&resident) {
                if existing.visible_at <= visible_at {
                    debug!(queue = %queue, fingerprint = payload.fingerprint(), "coalesced duplicate push");
                    return Ok(());
                }
            }
        }

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let rec = QueueRecord {
            payload,
            priority,
            push_seq: id,
            visible_at,
            delivery_count: 0,
            pushed_at: now,
            last_error: None,
        };
        state.insert(id, rec, now.timestamp_millis());
        drop(states);
        self.notify[queue.index()].notify_one();
        Ok(())
    }

    async fn lease(&self, queue: QueueName, ctx: &CancellationToken) -> Result<Leased, QueueError> {
        loop {
            if let Some(leased) = self.try_lease(queue).await? {
                return Ok(leased);
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(QueueError::Canceled),
                _ = self.notify[queue.index()].notified() => {}
                _ = tokio::time::sleep(LEASE_POLL_INTERVAL) => {}
            }
        }
    }

    async fn try_lease(&self, queue: QueueName) -> Result<Option<Leased>, QueueError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let mut states = self.states.lock().await;
        let state = &mut states[queue.index()];
        state.promote(now_ms);

        let Some((id, _)) = state.ready.pop() else {
            return Ok(None);
        };
        let rec = state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::Unavailable("record vanished under lease".into()))?;

        // Leased records are no longer resident for coalescing purposes.
        if state.by_fingerprint.get(rec.payload.fingerprint()) == Some(&id) {
            state.by_fingerprint.remove(rec.payload.fingerprint());
        }

        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let expires_ms = now_ms + self.settings.visibility_timeout.as_millis() as i64;
        state.leased.insert(id, Lease { nonce, expires_ms });
        state.lease_expiry.insert((expires_ms, id), ());

        Ok(Some(Leased {
            record: rec,
            token: LeaseToken(format!("{queue}:{id}:{nonce}")),
        }))
    }

    async fn ack(&self, queue: QueueName, token: &LeaseToken) -> Result<(), QueueError> {
        let (id, nonce) = Self::parse_token(token)?;
        let mut states = self.states.lock().await;
        let state = &mut states[queue.index()];
        let Some(lease) = state.leased.remove(&id) else {
            return Err(QueueError::UnknownLease(token.0.clone()));
        };
        if lease.nonce != nonce {
            state.leased.insert(id, lease);
            return Err(QueueError::UnknownLease(token.0.clone()));
        }
        state.lease_expiry.remove(&(lease.expires_ms, id));
        state.records.remove(&id);
        Ok(())
    }

    async fn nack(
        &self,
        queue: QueueName,
        token: &LeaseToken,
        delay: Duration,
        last_error: Option<String>,
    ) -> Result<NackOutcome, QueueError> {
        let (id, nonce) = Self::parse_token(token)?;
        let now = Utc::now();
        let mut states = self.states.lock().await;
        let state = &mut states[queue.index()];
        let Some(lease) = state.leased.remove(&id) else {
            return Err(QueueError::UnknownLease(token.0.clone()));
        };
        if lease.nonce != nonce {
            state.leased.insert(id, lease);
            return Err(QueueError::UnknownLease(token.0.clone()));
        }
        state.lease_expiry.remove(&(lease.expires_ms, id));

        let mut rec = state
            .records
            .remove(&id)
            .ok_or_else(|| QueueError::UnknownLease(token.0.clone()))?;
        rec.delivery_count += 1;
        if last_error.is_some() {
            rec.last_error = last_error;
        }

        if rec.delivery_count > self.settings.max_retries && queue != QueueName::Dead {
            rec.visible_at = now;
            debug!(
                queue = %queue,
                fingerprint = rec.payload.fingerprint(),
                delivery_count = rec.delivery_count,
                "promoting record to dead queue"
            );
            states[QueueName::Dead.index()].insert(id, rec, now.timestamp_millis());
            drop(states);
            self.notify[QueueName::Dead.index()].notify_one();
            return Ok(NackOutcome::DeadLettered);
        }

        let visible_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        rec.visible_at = visible_at;
        state.insert(id, rec, now.timestamp_millis());
        drop(states);
        self.notify[queue.index()].notify_one();
        Ok(NackOutcome::Requeued { visible_at })
    }

    async fn size(&self, queue: QueueName) -> Result<u64, QueueError> {
        let states = self.states.lock().await;
        Ok(states[queue.index()].records.len() as u64)
    }

    async fn oldest_age(&self, queue: QueueName) -> Result<Option<Duration>, QueueError> {
        let states = self.states.lock().await;
        let state = &states[queue.index()];
        let oldest = state
            .records
            .iter()
            .filter(|(id, _)| !state.leased.contains_key(*id))
            .map(|(_, rec)| rec.pushed_at)
            .min();
        Ok(oldest.map(|t| (Utc::now() - t).to_std().unwrap_or_default()))
    }

    async fn clear(&self, queue: QueueName) -> Result<(), QueueError> {
        let mut states = self.states.lock().await;
        states[queue.index()] = QueueState::default();
        Ok(())
    }
}
