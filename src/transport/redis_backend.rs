//! Redis-based queue engine using a list, a sorted set and a claim set.
//!
//! Key structure:
//! - `{queue}` - Ready message ids, FIFO (List)
//! - `{delayed_queue}` - Delayed message ids (Sorted Set, score = available-at ms)
//! - `{queue}:inflight` - Claimed message ids (Sorted Set, score = claim ms)
//! - `{queue}:messages` - Message payloads by id (Hash)
//!
//! Every state change runs as one Lua script or MULTI block, so concurrent
//! consumers rely on Redis executing commands one at a time. Abandoned claims
//! are only reclaimed by a later `poll`; a queue nobody polls keeps its
//! expired claims.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{RedisResult, Script};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::infrastructure::current_time_ms;
use crate::infrastructure::redis::RedisPool;
use crate::infrastructure::retry::retry_with_backoff;
use crate::metrics::EngineMetrics;

use super::backend::{check_keepalive, MessageId, QueueEngine, QueueMessage};
use super::envelope::Envelope;
use super::models::RedisQueueConfig;

const BACKEND: &str = "redis";

/// KEYS: ready, delayed, messages
/// ARGV: id, payload, available-at ms (0 = ready now), max entries (0 = unbounded)
/// Returns the number of ready entries dropped by the bound.
const SEND_SCRIPT: &str = r#"
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
local available_at = tonumber(ARGV[3])
if available_at > 0 then
    redis.call('ZADD', KEYS[2], available_at, ARGV[1])
    return 0
end
redis.call('RPUSH', KEYS[1], ARGV[1])
local dropped = 0
local max_entries = tonumber(ARGV[4])
if max_entries > 0 then
    while redis.call('LLEN', KEYS[1]) > max_entries do
        local oldest = redis.call('LPOP', KEYS[1])
        redis.call('HDEL', KEYS[3], oldest)
        dropped = dropped + 1
    end
end
return dropped
"#;

/// KEYS: ready, delayed, inflight, messages
/// ARGV: now ms, reclaim cutoff ms (-1 = skip the abandoned-claim scan)
/// Returns {reclaimed} or {reclaimed, id, payload}.
const POLL_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('RPUSH', KEYS[1], id)
end
local reclaimed = 0
local cutoff = tonumber(ARGV[2])
if cutoff >= 0 then
    local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', '(' .. cutoff)
    for i = #expired, 1, -1 do
        redis.call('ZREM', KEYS[3], expired[i])
        redis.call('LPUSH', KEYS[1], expired[i])
        reclaimed = reclaimed + 1
    end
end
while true do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        return {tostring(reclaimed)}
    end
    local payload = redis.call('HGET', KEYS[4], id)
    if payload then
        redis.call('ZADD', KEYS[3], now, id)
        return {tostring(reclaimed), id, payload}
    end
end
"#;

/// Serialized form of a message in the payload hash.
#[derive(Debug, Serialize, Deserialize)]
struct StoredPayload {
    body: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    created_at_ms: i64,
    available_at_ms: i64,
}

/// Redis-based queue engine.
pub struct RedisQueueEngine {
    /// Redis connection pool
    pool: Arc<RedisPool>,

    config: RedisQueueConfig,

    inflight_key: String,
    messages_key: String,

    send_script: Script,
    poll_script: Script,

    /// Last abandoned-claim scan by this instance (ms since epoch)
    last_claim_check_ms: AtomicI64,
}

impl RedisQueueEngine {
    /// Create a new Redis queue engine. The configuration is validated here.
    pub fn new(config: RedisQueueConfig, pool: Arc<RedisPool>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            pool,
            inflight_key: format!("{}:inflight", config.queue),
            messages_key: format!("{}:messages", config.queue),
            config,
            send_script: Script::new(SEND_SCRIPT),
            poll_script: Script::new(POLL_SCRIPT),
            last_claim_check_ms: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.config.retry, operation, QueueError::is_retryable, op).await
    }

    /// Map a command result, dropping the pooled connection if it broke.
    async fn check<T>(&self, result: RedisResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.pool.observe_error(&e).await;
                Err(QueueError::Redis(e))
            }
        }
    }

    /// Cutoff for the abandoned-claim scan, or -1 when the last scan by this
    /// instance is more recent than `claim_interval`.
    fn reclaim_cutoff(&self, now_ms: i64) -> i64 {
        let interval_ms = self.config.claim_interval.as_millis() as i64;
        let last = self.last_claim_check_ms.load(Ordering::Acquire);

        let due = now_ms - last >= interval_ms
            && self
                .last_claim_check_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

        if due {
            (now_ms - self.config.redeliver_timeout.as_millis() as i64).max(0)
        } else {
            -1
        }
    }

    async fn try_send(&self, id: &str, payload: &str, available_at_ms: i64) -> Result<u64> {
        let mut conn = self.pool.get_connection().await?;
        let result = self
            .send_script
            .key(&self.config.queue)
            .key(&self.config.delayed_queue)
            .key(&self.messages_key)
            .arg(id)
            .arg(payload)
            .arg(available_at_ms)
            .arg(self.config.queue_max_entries)
            .invoke_async(&mut conn)
            .await;
        self.check(result).await
    }

    async fn try_poll(&self, now_ms: i64, cutoff_ms: i64) -> Result<Vec<String>> {
        let mut conn = self.pool.get_connection().await?;
        let result = self
            .poll_script
            .key(&self.config.queue)
            .key(&self.config.delayed_queue)
            .key(&self.inflight_key)
            .key(&self.messages_key)
            .arg(now_ms)
            .arg(cutoff_ms)
            .invoke_async(&mut conn)
            .await;
        self.check(result).await
    }

    async fn try_remove(&self, id: &str) -> Result<bool> {
        let mut conn = self.pool.get_connection().await?;
        let result: RedisResult<(u64, u64)> = redis::pipe()
            .atomic()
            .zrem(&self.inflight_key, id)
            .hdel(&self.messages_key, id)
            .query_async(&mut conn)
            .await;
        let (_, removed) = self.check(result).await?;
        Ok(removed > 0)
    }

    async fn try_keepalive(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get_connection().await?;
        // XX: only refresh an existing claim, never create one
        let result: RedisResult<u64> = redis::cmd("ZADD")
            .arg(&self.inflight_key)
            .arg("XX")
            .arg(current_time_ms())
            .arg(id)
            .query_async(&mut conn)
            .await;
        self.check(result).await.map(|_| ())
    }

    async fn try_count(&self) -> Result<(u64, u64, u64)> {
        let mut conn = self.pool.get_connection().await?;
        let result = redis::pipe()
            .llen(&self.config.queue)
            .zcard(&self.config.delayed_queue)
            .zcard(&self.inflight_key)
            .query_async(&mut conn)
            .await;
        self.check(result).await
    }

    fn decode_claim(&self, id: String, payload: &str, now_ms: i64) -> Result<QueueMessage> {
        let stored: StoredPayload = serde_json::from_str(payload)?;
        Ok(QueueMessage {
            id: MessageId::new(id),
            body: stored.body,
            headers: stored.headers,
            queue_name: self.config.queue.clone(),
            created_at: from_millis(stored.created_at_ms),
            available_at: from_millis(stored.available_at_ms),
            delivered_at: Some(from_millis(now_ms)),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl QueueEngine for RedisQueueEngine {
    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn queue_name(&self) -> &str {
        &self.config.queue
    }

    fn redeliver_timeout(&self) -> Duration {
        self.config.redeliver_timeout
    }

    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<MessageId> {
        let id = Uuid::new_v4().to_string();
        let now_ms = current_time_ms();
        let available_at_ms = if delay.is_zero() {
            0
        } else {
            now_ms + delay.as_millis() as i64
        };

        let payload = serde_json::to_string(&StoredPayload {
            body: envelope.body.clone(),
            headers: envelope.headers.clone(),
            created_at_ms: now_ms,
            available_at_ms: available_at_ms.max(now_ms),
        })?;

        let dropped = self
            .run("redis.send", || self.try_send(&id, &payload, available_at_ms))
            .await?;

        EngineMetrics::record_sent(BACKEND);
        if dropped > 0 {
            EngineMetrics::record_dropped(BACKEND, dropped);
            tracing::debug!(
                queue = %self.config.queue,
                dropped = dropped,
                max_entries = self.config.queue_max_entries,
                "Dropped oldest ready entries from full queue"
            );
        }
        tracing::trace!(queue = %self.config.queue, message_id = %id, "Message pushed to Redis");

        Ok(MessageId::new(id))
    }

    async fn poll(&self) -> Result<Option<QueueMessage>> {
        let now_ms = current_time_ms();
        let cutoff_ms = self.reclaim_cutoff(now_ms);

        let reply = self
            .run("redis.poll", || self.try_poll(now_ms, cutoff_ms))
            .await?;

        let mut parts = reply.into_iter();
        let reclaimed: u64 = parts
            .next()
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);
        if reclaimed > 0 {
            EngineMetrics::record_reclaimed(BACKEND, reclaimed);
            tracing::debug!(
                queue = %self.config.queue,
                reclaimed = reclaimed,
                "Abandoned claims returned to the ready list"
            );
        }

        let (Some(id), Some(payload)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };

        EngineMetrics::record_received(BACKEND);
        self.decode_claim(id, &payload, now_ms).map(Some)
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        if self.run("redis.ack", || self.try_remove(id.as_str())).await? {
            EngineMetrics::record_acked(BACKEND);
        }
        Ok(())
    }

    async fn reject(&self, id: &MessageId) -> Result<()> {
        if self.run("redis.reject", || self.try_remove(id.as_str())).await? {
            EngineMetrics::record_rejected(BACKEND);
        }
        Ok(())
    }

    async fn keepalive(&self, id: &MessageId, extend: Option<Duration>) -> Result<()> {
        check_keepalive(extend, self.config.redeliver_timeout)?;
        self.run("redis.keepalive", || self.try_keepalive(id.as_str()))
            .await
    }

    async fn count(&self) -> Result<u64> {
        let (ready, delayed, inflight) = self.run("redis.count", || self.try_count()).await?;
        Ok(ready + delayed + inflight)
    }

    async fn setup(&self) -> Result<()> {
        // Lists and sorted sets are created by their first write
        tracing::debug!(queue = %self.config.queue, "Redis queue needs no setup");
        Ok(())
    }
}
