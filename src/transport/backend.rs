//! Queue engine contract.
//!
//! Every storage backend implements [`QueueEngine`]. An engine instance serves
//! exactly one queue; mutual exclusion between consumers is delegated to the
//! store (row locks, atomic scripts), never to in-process locks.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

use super::envelope::Envelope;

/// Backend-assigned message identifier, unique within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric form, for backends with integer keys.
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A message as stored by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: MessageId,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    /// Invisible to consumers until this instant
    pub available_at: DateTime<Utc>,
    /// Claim timestamp; `None` while unclaimed
    pub delivered_at: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// Split into the backend id and the transported envelope.
    pub fn into_parts(self) -> (MessageId, Envelope) {
        (
            self.id,
            Envelope {
                body: self.body,
                headers: self.headers,
            },
        )
    }
}

/// Backend trait for reliable, at-least-once queue storage.
///
/// # Guarantees
///
/// - `poll` claims at most one message and never hands the same message to
///   two concurrent callers. A claim that is neither acked, rejected nor kept
///   alive for longer than [`redeliver_timeout`](QueueEngine::redeliver_timeout)
///   is abandoned and the message becomes pollable again.
/// - `ack` and `reject` are idempotent: removing an unknown id is a no-op.
/// - `poll` never waits for messages to arrive; callers loop.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; several engine instances, in one or
/// many processes, may point at the same storage.
#[async_trait]
pub trait QueueEngine: Send + Sync {
    /// Backend type identifier (`"postgres"`, `"redis"`, `"memory"`)
    fn backend_type(&self) -> &'static str;

    /// The logical queue this engine serves
    fn queue_name(&self) -> &str;

    /// Age after which an unacknowledged claim is treated as abandoned
    fn redeliver_timeout(&self) -> Duration;

    /// Persist a message, visible to consumers once `delay` has elapsed.
    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<MessageId>;

    /// Claim and return at most one available message.
    async fn poll(&self) -> Result<Option<QueueMessage>>;

    /// Remove a processed message.
    async fn ack(&self, id: &MessageId) -> Result<()>;

    /// Remove a message without redelivery.
    async fn reject(&self, id: &MessageId) -> Result<()>;

    /// Refresh the claim clock of a message still being processed.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::KeepaliveExceedsTimeout` if `extend` is longer than
    /// the redeliver timeout.
    async fn keepalive(&self, id: &MessageId, extend: Option<Duration>) -> Result<()>;

    /// Approximate number of messages belonging to this queue.
    async fn count(&self) -> Result<u64>;

    /// Create the structures the backend needs. Idempotent.
    async fn setup(&self) -> Result<()>;
}

/// Inspection of stored messages without claiming them.
#[async_trait]
pub trait ListableQueue: QueueEngine {
    /// Look up one message of this queue by id.
    async fn find(&self, id: &MessageId) -> Result<Option<QueueMessage>>;

    /// Up to `limit` currently pollable messages, oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<QueueMessage>>;
}

/// Reject keepalive extensions longer than the redeliver timeout.
pub(crate) fn check_keepalive(extend: Option<Duration>, timeout: Duration) -> Result<()> {
    match extend {
        Some(requested) if requested > timeout => {
            Err(QueueError::KeepaliveExceedsTimeout { requested, timeout })
        }
        _ => Ok(()),
    }
}

/// Convert a std duration into a chrono delta for timestamp arithmetic.
pub(crate) fn to_time_delta(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| QueueError::InvalidConfig(format!("duration {:?} is out of range", duration)))
}
