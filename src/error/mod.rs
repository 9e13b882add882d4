//! Unified error type for queue engines, transports and the failover layer.

use std::time::Duration;

use thiserror::Error;

/// SQLSTATE codes PostgreSQL reports for conditions worth retrying.
const PG_SERIALIZATION_FAILURE: &str = "40001";
const PG_DEADLOCK_DETECTED: &str = "40P01";
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
const PG_UNDEFINED_TABLE: &str = "42P01";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend could not be reached (pool closed, no connection)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The queue table is missing and could not be created
    #[error("Queue table \"{table}\" does not exist")]
    TableNotFound { table: String },

    #[error("Operation \"{operation}\" failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<QueueError>,
    },

    /// Message body could not be decoded; the message has been rejected
    #[error("Could not decode message: {0}")]
    Decode(String),

    /// Provenance names a transport this receiver does not own
    #[error("Envelope was not received from transport \"{0}\"")]
    UnknownTransport(String),

    #[error("Keepalive of {requested:?} exceeds the redeliver timeout of {timeout:?}")]
    KeepaliveExceedsTimeout { requested: Duration, timeout: Duration },

    #[error("Failover needs at least 2 transports, {given} given")]
    NotEnoughTransports { given: usize },

    /// Every candidate was filtered out by the circuit breaker
    #[error("No available transports: every circuit is open")]
    NoAvailableTransports,

    /// Every candidate was attempted and failed
    #[error("All transports failed (tried: {}): {source}", attempted.join(", "))]
    AllTransportsFailed {
        attempted: Vec<String>,
        #[source]
        source: Box<QueueError>,
    },
}

impl QueueError {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Postgres(e) => match e {
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    Some(PG_SERIALIZATION_FAILURE | PG_DEADLOCK_DETECTED | PG_LOCK_NOT_AVAILABLE)
                ),
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                _ => false,
            },
            QueueError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            QueueError::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Whether the failure means the queue table does not exist yet.
    pub fn is_table_missing(&self) -> bool {
        match self {
            QueueError::Postgres(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some(PG_UNDEFINED_TABLE)
            }
            QueueError::TableNotFound { .. } => true,
            _ => false,
        }
    }

    /// Programming errors: never retried, never counted against a backend.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            QueueError::UnknownTransport(_)
                | QueueError::KeepaliveExceedsTimeout { .. }
                | QueueError::NotEnoughTransports { .. }
                | QueueError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
