//! In-memory queue engine using DashMap.
//!
//! Mirrors the relational engine: one row per message, a `delivered_at`
//! stamp doubling as claim marker and claim timestamp. Messages are lost on
//! restart. Several engine instances can share one [`MemoryStore`], in which
//! case they behave like consumers of the same table.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::Result;
use crate::metrics::EngineMetrics;

use super::backend::{
    check_keepalive, to_time_delta, ListableQueue, MessageId, QueueEngine, QueueMessage,
};
use super::envelope::Envelope;
use super::models::MemoryQueueConfig;

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
struct StoredRow {
    body: String,
    headers: HashMap<String, String>,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    fn is_pollable(&self, now: DateTime<Utc>, redeliver_limit: DateTime<Utc>) -> bool {
        self.available_at <= now
            && self
                .delivered_at
                .map_or(true, |delivered| delivered < redeliver_limit)
    }

    fn to_message(&self, id: u64, queue_name: &str) -> QueueMessage {
        QueueMessage {
            id: MessageId::from(id),
            body: self.body.clone(),
            headers: self.headers.clone(),
            queue_name: queue_name.to_string(),
            created_at: self.created_at,
            available_at: self.available_at,
            delivered_at: self.delivered_at,
        }
    }
}

/// Shared storage for in-memory engines: rows per queue name.
#[derive(Default)]
pub struct MemoryStore {
    queues: DashMap<String, BTreeMap<u64, StoredRow>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across every queue.
    pub fn total_messages(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }
}

/// In-memory queue engine.
pub struct MemoryQueueEngine {
    store: Arc<MemoryStore>,
    config: MemoryQueueConfig,
    redeliver_timeout: chrono::Duration,
}

impl MemoryQueueEngine {
    /// Create an engine with its own private store.
    pub fn new(config: MemoryQueueConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create an engine on a store shared with other engines.
    pub fn with_store(config: MemoryQueueConfig, store: Arc<MemoryStore>) -> Result<Self> {
        config.validate()?;
        let redeliver_timeout = to_time_delta(config.redeliver_timeout)?;
        Ok(Self {
            store,
            config,
            redeliver_timeout,
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn remove(&self, id: &MessageId) -> bool {
        let Some(id) = id.as_i64() else {
            return false;
        };
        self.store
            .queues
            .get_mut(&self.config.queue_name)
            .map_or(false, |mut rows| rows.remove(&(id as u64)).is_some())
    }
}

#[async_trait]
impl QueueEngine for MemoryQueueEngine {
    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    fn redeliver_timeout(&self) -> Duration {
        self.config.redeliver_timeout
    }

    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<MessageId> {
        let now = Utc::now();
        let row = StoredRow {
            body: envelope.body.clone(),
            headers: envelope.headers.clone(),
            created_at: now,
            available_at: now + to_time_delta(delay)?,
            delivered_at: None,
        };

        let id = self.store.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.store
            .queues
            .entry(self.config.queue_name.clone())
            .or_default()
            .insert(id, row);

        EngineMetrics::record_sent(BACKEND);
        tracing::trace!(queue = %self.config.queue_name, message_id = id, "Message stored in memory");

        Ok(MessageId::from(id))
    }

    async fn poll(&self) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let redeliver_limit = now - self.redeliver_timeout;

        // The entry guard locks this queue's shard for the whole claim
        let Some(mut rows) = self.store.queues.get_mut(&self.config.queue_name) else {
            return Ok(None);
        };

        let next = rows
            .iter()
            .filter(|(_, row)| row.is_pollable(now, redeliver_limit))
            .min_by_key(|(id, row)| (row.available_at, **id))
            .map(|(id, _)| *id);

        let Some(id) = next else {
            return Ok(None);
        };

        let message = rows.get_mut(&id).map(|row| {
            row.delivered_at = Some(now);
            row.to_message(id, &self.config.queue_name)
        });

        if message.is_some() {
            EngineMetrics::record_received(BACKEND);
        }
        Ok(message)
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        if self.remove(id) {
            EngineMetrics::record_acked(BACKEND);
        }
        Ok(())
    }

    async fn reject(&self, id: &MessageId) -> Result<()> {
        if self.remove(id) {
            EngineMetrics::record_rejected(BACKEND);
        }
        Ok(())
    }

    async fn keepalive(&self, id: &MessageId, extend: Option<Duration>) -> Result<()> {
        check_keepalive(extend, self.config.redeliver_timeout)?;

        if let (Some(id), Some(mut rows)) = (
            id.as_i64(),
            self.store.queues.get_mut(&self.config.queue_name),
        ) {
            // Only an existing claim is refreshed
            if let Some(row) = rows.get_mut(&(id as u64)) {
                if row.delivered_at.is_some() {
                    row.delivered_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let now = Utc::now();
        let redeliver_limit = now - self.redeliver_timeout;

        Ok(self
            .store
            .queues
            .get(&self.config.queue_name)
            .map_or(0, |rows| {
                rows.values()
                    .filter(|row| row.is_pollable(now, redeliver_limit))
                    .count() as u64
            }))
    }

    async fn setup(&self) -> Result<()> {
        self.store
            .queues
            .entry(self.config.queue_name.clone())
            .or_default();
        Ok(())
    }
}

#[async_trait]
impl ListableQueue for MemoryQueueEngine {
    async fn find(&self, id: &MessageId) -> Result<Option<QueueMessage>> {
        let Some(numeric) = id.as_i64() else {
            return Ok(None);
        };
        Ok(self
            .store
            .queues
            .get(&self.config.queue_name)
            .and_then(|rows| {
                rows.get(&(numeric as u64))
                    .map(|row| row.to_message(numeric as u64, &self.config.queue_name))
            }))
    }

    async fn list(&self, limit: usize) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let redeliver_limit = now - self.redeliver_timeout;

        let Some(rows) = self.store.queues.get(&self.config.queue_name) else {
            return Ok(Vec::new());
        };

        let mut pollable: Vec<(u64, &StoredRow)> = rows
            .iter()
            .filter(|(_, row)| row.is_pollable(now, redeliver_limit))
            .map(|(id, row)| (*id, row))
            .collect();
        pollable.sort_by_key(|(id, row)| (row.available_at, *id));

        Ok(pollable
            .into_iter()
            .take(limit)
            .map(|(id, row)| row.to_message(id, &self.config.queue_name))
            .collect())
    }
}
