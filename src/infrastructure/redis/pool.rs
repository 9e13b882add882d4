//! Redis connection pool for the key/sorted-set queue engine.

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tokio::sync::RwLock;

use crate::error::QueueError;

use super::super::postgres::pool::mask_url;

/// Redis connection pool.
///
/// Manages a single multiplexed connection shared across tasks. The
/// connection is established lazily and dropped again when a command
/// reports a broken connection, so the next caller reconnects.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    url: String,
}

impl RedisPool {
    /// Create a new Redis pool. No connection is made until first use.
    pub fn new(url: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            url: url.to_string(),
        })
    }

    /// Get a connection from the pool, connecting if needed.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    /// Establish a new connection.
    async fn connect(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                tracing::info!(url = %self.url_masked(), "Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(QueueError::Redis(e))
            }
        }
    }

    /// Inspect a command error; drop the cached connection if it is broken.
    pub async fn observe_error(&self, error: &RedisError) {
        if error.is_connection_dropped() || error.is_io_error() {
            let mut conn_guard = self.connection.write().await;
            *conn_guard = None;
            tracing::warn!(error = %error, "Redis connection lost, will reconnect");
        }
    }

    /// Get the Redis URL with its password masked.
    pub fn url_masked(&self) -> String {
        mask_url(&self.url)
    }

    /// Ping Redis to check connectivity.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.get_connection().await?;
        let result: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.observe_error(&e).await;
                Err(QueueError::Redis(e))
            }
        }
    }
}
