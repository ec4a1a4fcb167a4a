//! Durable backend on redis: one ZSET each for ready (scored by rank),
//! delayed (scored by visible_at) and leases (scored by expiry), a hash per
//! record, and a fingerprint hash for coalescing. Every operation that must
//! be atomic runs as a single Lua script.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    Leased, LeaseToken, NackOutcome, QueueBackend, QueueError, QueueName, QueuePayload,
    QueueRecord, QueueSettings, LEASE_POLL_INTERVAL,
};

/// Priority band width in the ready-ZSET score: rank = (10 - priority) *
/// 2^44 + push_seq, so lower scores are higher priority and, within a
/// priority, older pushes. Exact in an f64 up to 2^44 pushes.
const PRIORITY_BAND: f64 = 17_592_186_044_416.0;

/// I/O retry budget inside each queue call before the error escapes as
/// `Unavailable`.
const IO_ATTEMPTS: u32 = 3;

/// The immutable part of a record, written once at push time. Mutable state
/// (visible_at, delivery_count, last_error, lease token) lives in plain hash
/// fields so the scripts never have to re-encode JSON.
#[derive(Serialize, Deserialize)]
struct WireRecord {
    payload: QueuePayload,
    priority: u8,
    push_seq: u64,
    pushed_at_ms: i64,
}

const PUSH_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[3], ARGV[4])
if existing then
  local evis = redis.call('HGET', ARGV[1] .. existing, 'vis')
  if evis and tonumber(evis) <= tonumber(ARGV[6]) then
    return 0
  end
end
local rkey = ARGV[1] .. ARGV[2]
redis.call('HSET', rkey, 'json', ARGV[3], 'rank', ARGV[5], 'vis', ARGV[6], 'dc', 0, 'fp', ARGV[4])
redis.call('HSET', KEYS[3], ARGV[4], ARGV[2])
if tonumber(ARGV[6]) <= tonumber(ARGV[7]) then
  redis.call('ZADD', KEYS[1], ARGV[5], ARGV[2])
else
  redis.call('ZADD', KEYS[2], ARGV[6], ARGV[2])
end
return 1
"#;

const LEASE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(due) do
  local rank = redis.call('HGET', ARGV[1] .. id, 'rank')
  if rank then redis.call('ZADD', KEYS[1], rank, id) end
  redis.call('ZREM', KEYS[2], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[2])
for _, id in ipairs(expired) do
  local rkey = ARGV[1] .. id
  local rank = redis.call('HGET', rkey, 'rank')
  if rank then
    redis.call('ZADD', KEYS[1], rank, id)
    local fpv = redis.call('HGET', rkey, 'fp')
    if fpv then redis.call('HSETNX', KEYS[4], fpv, id) end
  end
  redis.call('ZREM', KEYS[3], id)
  redis.call('HDEL', rkey, 'tok')
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return false end
local id = popped[1]
local rkey = ARGV[1] .. id
redis.call('ZADD', KEYS[3], ARGV[3], id)
redis.call('HSET', rkey, 'tok', ARGV[4])
local fpv = redis.call('HGET', rkey, 'fp')
if fpv and redis.call('HGET', KEYS[4], fpv) == id then
  redis.call('HDEL', KEYS[4], fpv)
end
local json = redis.call('HGET', rkey, 'json')
local dc = redis.call('HGET', rkey, 'dc')
local vis = redis.call('HGET', rkey, 'vis')
local err = redis.call('HGET', rkey, 'err')
return {id, json, dc, vis, err or ''}
"#;

const ACK_SCRIPT: &str = r#"
local rkey = ARGV[1] .. ARGV[2]
if redis.call('HGET', rkey, 'tok') ~= ARGV[3] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[2])
local fpv = redis.call('HGET', rkey, 'fp')
if fpv and redis.call('HGET', KEYS[2], fpv) == ARGV[2] then
  redis.call('HDEL', KEYS[2], fpv)
end
redis.call('DEL', rkey)
return 1
"#;

const NACK_SCRIPT: &str = r#"
local rkey = ARGV[1] .. ARGV[3]
if redis.call('HGET', rkey, 'tok') ~= ARGV[4] then return 'unknown' end
redis.call('ZREM', KEYS[1], ARGV[3])
redis.call('HDEL', rkey, 'tok')
local dc = redis.call('HINCRBY', rkey, 'dc', 1)
if ARGV[8] ~= '' then redis.call('HSET', rkey, 'err', ARGV[8]) end
local fpv = redis.call('HGET', rkey, 'fp')
if dc > tonumber(ARGV[7]) then
  local dkey = ARGV[2] .. ARGV[3]
  local json = redis.call('HGET', rkey, 'json')
  local rank = redis.call('HGET', rkey, 'rank')
  local err = redis.call('HGET', rkey, 'err')
  redis.call('HSET', dkey, 'json', json, 'rank', rank, 'vis', ARGV[5], 'dc', dc)
  if err then redis.call('HSET', dkey, 'err', err) end
  if fpv then
    redis.call('HSET', dkey, 'fp', fpv)
    redis.call('HSET', KEYS[6], fpv, ARGV[3])
  end
  redis.call('ZADD', KEYS[5], rank, ARGV[3])
  redis.call('DEL', rkey)
  return 'dead'
end
redis.call('HSET', rkey, 'vis', ARGV[6])
if fpv then redis.call('HSET', KEYS[4], fpv, ARGV[3]) end
if tonumber(ARGV[6]) <= tonumber(ARGV[5]) then
  local rank = redis.call('HGET', rkey, 'rank')
  redis.call('ZADD', KEYS[2], rank, ARGV[3])
else
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[3])
end
return 'requeued'
"#;

const CLEAR_SCRIPT: &str = r#"
local ids = {}
for _, k in ipairs({KEYS[1], KEYS[2], KEYS[3]}) do
  for _, id in ipairs(redis.call('ZRANGE', k, 0, -1)) do
    table.insert(ids, id)
  end
end
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3], KEYS[4])
return #ids
"#;

pub struct RedisQueue {
    conn: MultiplexedConnection,
    prefix: String,
    settings: QueueSettings,
    push_script: Script,
    lease_script: Script,
    ack_script: Script,
    nack_script: Script,
    clear_script: Script,
}

impl RedisQueue {
    pub async fn connect(
        url: &str,
        prefix: &str,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(url).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            prefix: prefix.to_owned(),
            settings,
            push_script: Script::new(PUSH_SCRIPT),
            lease_script: Script::new(LEASE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            clear_script: Script::new(CLEAR_SCRIPT),
        })
    }

    fn key(&self, queue: QueueName, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue.as_str(), suffix)
    }

    fn rec_prefix(&self, queue: QueueName) -> String {
        format!("{}:{}:rec:", self.prefix, queue.as_str())
    }

    fn rank(priority: u8, push_seq: u64) -> f64 {
        f64::from(10u8.saturating_sub(priority.min(10))) * PRIORITY_BAND + push_seq as f64
    }

    async fn next_seq(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let seq: u64 = redis::cmd("INCR")
            .arg(format!("{}:seq", self.prefix))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(seq)
    }

    /// Retry transient I/O with exponential back-off before letting the
    /// error escape; §7 routes an exhausted budget to the caller as
    /// transient.
    async fn with_retries<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        let mut delay = Duration::from_millis(100);
        let mut last_err = None;
        for attempt in 0..IO_ATTEMPTS {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(op = op_name, attempt, error = %e, "redis queue op failed");
                    last_err = Some(e);
                    if attempt + 1 < IO_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(QueueError::Unavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn parse_token(token: &LeaseToken) -> Result<(String, String), QueueError> {
        match token.0.split_once('/') {
            Some((id, nonce)) if !id.is_empty() && !nonce.is_empty() => {
                Ok((id.to_owned(), nonce.to_owned()))
            }
            _ => Err(QueueError::UnknownLease(token.0.clone())),
        }
    }

    fn assemble(
        json: &str,
        delivery_count: u32,
        visible_ms: i64,
        last_error: String,
    ) -> Result<QueueRecord, QueueError> {
        let wire: WireRecord =
            serde_json::from_str(json).map_err(|e| QueueError::Serde(e.to_string()))?;
        let visible_at = Utc
            .timestamp_millis_opt(visible_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let pushed_at = Utc
            .timestamp_millis_opt(wire.pushed_at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(QueueRecord {
            payload: wire.payload,
            priority: wire.priority,
            push_seq: wire.push_seq,
            visible_at,
            delivery_count,
            pushed_at,
            last_error: if last_error.is_empty() {
                None
            } else {
                Some(last_error)
            },
        })
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(
        &self,
        queue: QueueName,
        payload: QueuePayload,
        priority: u8,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let seq = self.next_seq().await?;
        let now = Utc::now();
        let wire = WireRecord {
            payload,
            priority,
            push_seq: seq,
            pushed_at_ms: now.timestamp_millis(),
        };
        let fingerprint = wire.payload.fingerprint().to_owned();
        let json = serde_json::to_string(&wire).map_err(|e| QueueError::Serde(e.to_string()))?;
        let rank = Self::rank(priority, seq);

        let pushed: i64 = self
            .with_retries("push", || {
                let mut conn = self.conn.clone();
                let json = json.clone();
                let fingerprint = fingerprint.clone();
                async move {
                    self.push_script
                        .key(self.key(queue, "ready"))
                        .key(self.key(queue, "delayed"))
                        .key(self.key(queue, "fp"))
                        .arg(self.rec_prefix(queue))
                        .arg(seq.to_string())
                        .arg(json)
                        .arg(fingerprint)
                        .arg(rank)
                        .arg(visible_at.timestamp_millis())
                        .arg(now.timestamp_millis())
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        if pushed == 0 {
            debug!(queue = %queue, "coalesced duplicate push");
        }
        Ok(())
    }

    async fn lease(&self, queue: QueueName, ctx: &CancellationToken) -> Result<Leased, QueueError> {
        loop {
            if let Some(leased) = self.try_lease(queue).await? {
                return Ok(leased);
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(QueueError::Canceled),
                _ = tokio::time::sleep(LEASE_POLL_INTERVAL) => {}
            }
        }
    }

    async fn try_lease(&self, queue: QueueName) -> Result<Option<Leased>, QueueError> {
        let now = Utc::now();
        let expires_ms =
            now.timestamp_millis() + self.settings.visibility_timeout.as_millis() as i64;
        let nonce = format!("{:x}", rand::random::<u64>());

        let reply: Option<(String, String, u32, i64, String)> = self
            .with_retries("lease", || {
                let mut conn = self.conn.clone();
                let nonce = nonce.clone();
                async move {
                    self.lease_script
                        .key(self.key(queue, "ready"))
                        .key(self.key(queue, "delayed"))
                        .key(self.key(queue, "leases"))
                        .key(self.key(queue, "fp"))
                        .arg(self.rec_prefix(queue))
                        .arg(now.timestamp_millis())
                        .arg(expires_ms)
                        .arg(nonce)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        let Some((id, json, delivery_count, visible_ms, last_error)) = reply else {
            return Ok(None);
        };
        let record = Self::assemble(&json, delivery_count, visible_ms, last_error)?;
        Ok(Some(Leased {
            record,
            token: LeaseToken(format!("{id}/{nonce}")),
        }))
    }

    async fn ack(&self, queue: QueueName, token: &LeaseToken) -> Result<(), QueueError> {
        let (id, nonce) = Self::parse_token(token)?;
        let acked: i64 = self
            .with_retries("ack", || {
                let mut conn = self.conn.clone();
                let id = id.clone();
                let nonce = nonce.clone();
                async move {
                    self.ack_script
                        .key(self.key(queue, "leases"))
                        .key(self.key(queue, "fp"))
                        .arg(self.rec_prefix(queue))
                        .arg(id)
                        .arg(nonce)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        if acked == 0 {
            return Err(QueueError::UnknownLease(token.0.clone()));
        }
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
        let visible_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let err = last_error.unwrap_or_default();

        let outcome: String = self
            .with_retries("nack", || {
                let mut conn = self.conn.clone();
                let id = id.clone();
                let nonce = nonce.clone();
                let err = err.clone();
                async move {
                    self.nack_script
                        .key(self.key(queue, "leases"))
                        .key(self.key(queue, "ready"))
                        .key(self.key(queue, "delayed"))
                        .key(self.key(queue, "fp"))
                        .key(self.key(QueueName::Dead, "ready"))
                        .key(self.key(QueueName::Dead, "fp"))
                        .arg(self.rec_prefix(queue))
                        .arg(self.rec_prefix(QueueName::Dead))
                        .arg(id)
                        .arg(nonce)
                        .arg(now.timestamp_millis())
                        .arg(visible_at.timestamp_millis())
                        .arg(self.settings.max_retries)
                        .arg(err)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        match outcome.as_str() {
            "requeued" => Ok(NackOutcome::Requeued { visible_at }),
            "dead" => Ok(NackOutcome::DeadLettered),
            _ => Err(QueueError::UnknownLease(token.0.clone())),
        }
    }

    async fn size(&self, queue: QueueName) -> Result<u64, QueueError> {
        self.with_retries("size", || {
            let mut conn = self.conn.clone();
            async move {
                let (ready, delayed, leases): (u64, u64, u64) = redis::pipe()
                    .cmd("ZCARD")
                    .arg(self.key(queue, "ready"))
                    .cmd("ZCARD")
                    .arg(self.key(queue, "delayed"))
                    .cmd("ZCARD")
                    .arg(self.key(queue, "leases"))
                    .query_async(&mut conn)
                    .await?;
                Ok(ready + delayed + leases)
            }
        })
        .await
    }

    async fn oldest_age(&self, queue: QueueName) -> Result<Option<Duration>, QueueError> {
        // Best-effort: the head of the ready ZSET is the next record to
        // lease; its push time bounds the oldest visible age well enough for
        // a gauge.
        let head: Vec<String> = self
            .with_retries("oldest_age", || {
                let mut conn = self.conn.clone();
                async move {
                    redis::cmd("ZRANGE")
                        .arg(self.key(queue, "ready"))
                        .arg(0)
                        .arg(0)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        let Some(id) = head.into_iter().next() else {
            return Ok(None);
        };
        let json: Option<String> = self
            .with_retries("oldest_age", || {
                let mut conn = self.conn.clone();
                let key = format!("{}{}", self.rec_prefix(queue), id);
                async move {
                    redis::cmd("HGET")
                        .arg(key)
                        .arg("json")
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        let Some(json) = json else { return Ok(None) };
        let wire: WireRecord =
            serde_json::from_str(&json).map_err(|e| QueueError::Serde(e.to_string()))?;
        let pushed = Utc
            .timestamp_millis_opt(wire.pushed_at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Some((Utc::now() - pushed).to_std().unwrap_or_default()))
    }

    async fn clear(&self, queue: QueueName) -> Result<(), QueueError> {
        let _: i64 = self
            .with_retries("clear", || {
                let mut conn = self.conn.clone();
                async move {
                    self.clear_script
                        .key(self.key(queue, "ready"))
                        .key(self.key(queue, "delayed"))
                        .key(self.key(queue, "leases"))
                        .key(self.key(queue, "fp"))
                        .arg(self.rec_prefix(queue))
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_priority_then_fifo() {
        assert!(RedisQueue::rank(8, 100) < RedisQueue::rank(2, 1));
        assert!(RedisQueue::rank(5, 1) < RedisQueue::rank(5, 2));
        assert!(RedisQueue::rank(10, u64::MAX >> 24) < RedisQueue::rank(9, 0));
    }

    #[test]
    fn wire_record_round_trips() {
        let payload = QueuePayload::Crawl(trawler_core::CrawlUrl::new("http://a.com/x", "j").unwrap());
        let wire = WireRecord {
            payload,
            priority: 7,
            push_seq: 42,
            pushed_at_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&wire).unwrap();
        let rec = RedisQueue::assemble(&json, 2, 1_700_000_100_000, "boom".into()).unwrap();
        assert_eq!(rec.priority, 7);
        assert_eq!(rec.push_seq, 42);
        assert_eq!(rec.delivery_count, 2);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));
        assert_eq!(rec.visible_at.timestamp_millis(), 1_700_000_100_000);
    }

    // Exercising the scripts needs a live redis; run with
    // `cargo test -p trawler-queue -- --ignored` against a local instance.
    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn lease_ack_against_live_redis() {
        let q = RedisQueue::connect(
            "redis://127.0.0.1:6379",
            "trawler-test",
            QueueSettings::default(),
        )
        .await
        .unwrap();
        q.clear(QueueName::Frontier).await.unwrap();

        let payload = QueuePayload::Crawl(trawler_core::CrawlUrl::new("http://a.com/", "j").unwrap());
        q.push(QueueName::Frontier, payload, 5, Utc::now()).await.unwrap();
        assert_eq!(q.size(QueueName::Frontier).await.unwrap(), 1);

        let leased = q.try_lease(QueueName::Frontier).await.unwrap().unwrap();
        q.ack(QueueName::Frontier, &leased.token).await.unwrap();
        assert_eq!(q.size(QueueName::Frontier).await.unwrap(), 0);
    }
}
