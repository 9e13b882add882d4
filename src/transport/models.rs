//! Engine configuration, validated at construction time.

use std::time::Duration;

use crate::config::{
    MemoryTransportSettings, PostgresTransportSettings, RedisTransportSettings, RetrySettings,
};
use crate::error::{QueueError, Result};
use crate::infrastructure::retry::RetryPolicy;

/// PostgreSQL identifiers are truncated past this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// Maximum length of the `queue_name` column
pub const MAX_QUEUE_NAME_LEN: usize = 190;

/// Configuration of the relational engine
#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    /// Table holding the messages, optionally schema-qualified
    pub table_name: String,
    /// Logical queue; many queues may share a table
    pub queue_name: String,
    pub redeliver_timeout: Duration,
    /// Create the table on first use when it is missing
    pub auto_setup: bool,
    /// Skip rows locked by other consumers instead of waiting on them
    pub skip_locked: bool,
    pub retry: RetryPolicy,
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            table_name: "messenger_messages".to_string(),
            queue_name: "default".to_string(),
            redeliver_timeout: Duration::from_secs(3600),
            auto_setup: true,
            skip_locked: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl PostgresQueueConfig {
    pub fn from_settings(settings: &PostgresTransportSettings, retry: &RetrySettings) -> Self {
        Self {
            table_name: settings.table_name.clone(),
            queue_name: settings.queue_name.clone(),
            redeliver_timeout: Duration::from_secs(settings.redeliver_timeout),
            auto_setup: settings.auto_setup,
            skip_locked: settings.skip_locked,
            retry: RetryPolicy::from(retry),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table_name)?;
        validate_queue_name(&self.queue_name)?;
        validate_timeout(self.redeliver_timeout)
    }
}

/// Configuration of the key/sorted-set engine
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Key of the ready list
    pub queue: String,
    /// Key of the delayed sorted set
    pub delayed_queue: String,
    pub redeliver_timeout: Duration,
    /// Minimum spacing between scans for abandoned claims
    pub claim_interval: Duration,
    /// Ready-list bound; 0 keeps every entry
    pub queue_max_entries: usize,
    pub retry: RetryPolicy,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            queue: "messages".to_string(),
            delayed_queue: "messages__queue".to_string(),
            redeliver_timeout: Duration::from_secs(3600),
            claim_interval: Duration::from_millis(60_000),
            queue_max_entries: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl RedisQueueConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            delayed_queue: format!("{}__queue", queue),
            queue,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &RedisTransportSettings, retry: &RetrySettings) -> Self {
        Self {
            queue: settings.queue.clone(),
            delayed_queue: settings
                .delayed_queue
                .clone()
                .unwrap_or_else(|| format!("{}__queue", settings.queue)),
            redeliver_timeout: Duration::from_secs(settings.redeliver_timeout),
            claim_interval: Duration::from_millis(settings.claim_interval_ms),
            queue_max_entries: settings.queue_max_entries,
            retry: RetryPolicy::from(retry),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_queue_name(&self.queue)?;
        if self.delayed_queue.is_empty() || self.delayed_queue == self.queue {
            return Err(QueueError::InvalidConfig(format!(
                "delayed queue key must be non-empty and differ from \"{}\"",
                self.queue
            )));
        }
        validate_timeout(self.redeliver_timeout)
    }
}

/// Configuration of the in-memory engine
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    pub queue_name: String,
    pub redeliver_timeout: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            redeliver_timeout: Duration::from_secs(3600),
        }
    }
}

impl MemoryQueueConfig {
    pub fn new(queue_name: impl Into<String>, redeliver_timeout: Duration) -> Self {
        Self {
            queue_name: queue_name.into(),
            redeliver_timeout,
        }
    }

    pub fn from_settings(settings: &MemoryTransportSettings) -> Self {
        Self::new(
            settings.queue_name.clone(),
            Duration::from_secs(settings.redeliver_timeout),
        )
    }

    pub fn validate(&self) -> Result<()> {
        validate_queue_name(&self.queue_name)?;
        validate_timeout(self.redeliver_timeout)
    }
}

/// Accept `table` or `schema.table` made of ASCII letters, digits and `_`.
fn validate_table_name(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            !part.is_empty()
                && part.len() <= MAX_IDENTIFIER_LEN
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidConfig(format!(
            "invalid table name \"{}\"",
            table
        )))
    }
}

fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.len() > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::InvalidConfig(format!(
            "queue name must be 1 to {} bytes, got {}",
            MAX_QUEUE_NAME_LEN,
            queue.len()
        )));
    }
    Ok(())
}

fn validate_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(QueueError::InvalidConfig(
            "redeliver_timeout must be positive".to_string(),
        ));
    }
    Ok(())
}
