//! PostgreSQL-based queue engine.
//!
//! One row per message. A consumer claims a row inside a transaction by
//! selecting it `FOR UPDATE SKIP LOCKED` and stamping `delivered_at`; the
//! stamp doubles as claim marker and claim timestamp, so a claim older than
//! the redeliver timeout is simply eligible again. Many queues may share one
//! table, told apart by `queue_name`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{QueueError, Result};
use crate::infrastructure::postgres::PostgresPool;
use crate::infrastructure::retry::retry_with_backoff;
use crate::metrics::EngineMetrics;

use super::backend::{
    check_keepalive, to_time_delta, ListableQueue, MessageId, QueueEngine, QueueMessage,
};
use super::envelope::Envelope;
use super::models::{PostgresQueueConfig, MAX_QUEUE_NAME_LEN};

const BACKEND: &str = "postgres";

/// SQLSTATE codes raised when a concurrent setup created the table first
const PG_DUPLICATE_TABLE: &str = "42P07";
const PG_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    body: String,
    headers: String,
    queue_name: String,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

/// Headers are stored as a JSON object of strings.
fn decode_headers(raw: &str) -> Result<HashMap<String, String>> {
    serde_json::from_str(raw).map_err(|e| QueueError::Decode(format!("invalid headers: {e}")))
}

impl MessageRow {
    fn into_message(self) -> Result<QueueMessage> {
        let headers = decode_headers(&self.headers)?;
        Ok(self.with_headers(headers))
    }

    fn with_headers(self, headers: HashMap<String, String>) -> QueueMessage {
        QueueMessage {
            id: MessageId::from(self.id),
            body: self.body,
            headers,
            queue_name: self.queue_name,
            created_at: self.created_at,
            available_at: self.available_at,
            delivered_at: self.delivered_at,
        }
    }
}

/// SQL text for one table, rendered once at construction.
#[derive(Debug)]
struct Statements {
    insert: String,
    select_for_poll: String,
    mark_delivered: String,
    keepalive: String,
    delete: String,
    count: String,
    find: String,
    list: String,
    setup: Vec<String>,
}

impl Statements {
    fn new(table: &str, skip_locked: bool) -> Self {
        const COLUMNS: &str = "id, body, headers, queue_name, created_at, available_at, delivered_at";
        const POLLABLE: &str = "queue_name = $1 \
             AND (delivered_at IS NULL OR delivered_at < $2) \
             AND available_at <= $3";

        let lock = if skip_locked {
            "FOR UPDATE SKIP LOCKED"
        } else {
            "FOR UPDATE"
        };
        // Index names live in the table's schema and must not be qualified
        let index_prefix = table.rsplit('.').next().unwrap_or(table);

        Self {
            insert: format!(
                "INSERT INTO {table} (body, headers, queue_name, created_at, available_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id"
            ),
            select_for_poll: format!(
                "SELECT {COLUMNS} FROM {table} WHERE {POLLABLE} \
                 ORDER BY available_at ASC, id ASC LIMIT 1 {lock}"
            ),
            mark_delivered: format!("UPDATE {table} SET delivered_at = $1 WHERE id = $2"),
            keepalive: format!(
                "UPDATE {table} SET delivered_at = $1 \
                 WHERE id = $2 AND queue_name = $3 AND delivered_at IS NOT NULL"
            ),
            delete: format!("DELETE FROM {table} WHERE id = $1 AND queue_name = $2"),
            count: format!("SELECT COUNT(*) FROM {table} WHERE {POLLABLE}"),
            find: format!("SELECT {COLUMNS} FROM {table} WHERE id = $1 AND queue_name = $2"),
            list: format!(
                "SELECT {COLUMNS} FROM {table} WHERE {POLLABLE} \
                 ORDER BY available_at ASC, id ASC LIMIT $4"
            ),
            setup: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                     id BIGSERIAL PRIMARY KEY, \
                     body TEXT NOT NULL, \
                     headers TEXT NOT NULL, \
                     queue_name VARCHAR({MAX_QUEUE_NAME_LEN}) NOT NULL, \
                     created_at TIMESTAMPTZ NOT NULL, \
                     available_at TIMESTAMPTZ NOT NULL, \
                     delivered_at TIMESTAMPTZ NULL)"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {index_prefix}_queue_name_idx ON {table} (queue_name)"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {index_prefix}_available_at_idx ON {table} (available_at)"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {index_prefix}_delivered_at_idx ON {table} (delivered_at)"
                ),
            ],
        }
    }
}

/// PostgreSQL-based queue engine.
pub struct PostgresQueueEngine {
    pool: PgPool,
    config: PostgresQueueConfig,
    statements: Statements,
    redeliver_timeout: chrono::Duration,
}

impl PostgresQueueEngine {
    /// Create an engine on a shared pool. The configuration is validated here.
    pub fn new(config: PostgresQueueConfig, pool: &PostgresPool) -> Result<Self> {
        config.validate()?;
        let redeliver_timeout = to_time_delta(config.redeliver_timeout)?;
        let statements = Statements::new(&config.table_name, config.skip_locked);

        Ok(Self {
            pool: pool.pool().clone(),
            config,
            statements,
            redeliver_timeout,
        })
    }

    pub fn config(&self) -> &PostgresQueueConfig {
        &self.config
    }

    /// Run `op` with transient-error retries. A missing table triggers one
    /// `setup()` (when enabled) and one more run; a second miss is fatal.
    async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = retry_with_backoff(&self.config.retry, operation, QueueError::is_retryable, &op)
            .await;

        match first {
            Err(e) if e.is_table_missing() && self.config.auto_setup => {
                tracing::info!(
                    table = %self.config.table_name,
                    operation = %operation,
                    "Queue table missing, running setup"
                );
                EngineMetrics::record_auto_setup(BACKEND);
                self.setup().await?;

                match retry_with_backoff(&self.config.retry, operation, QueueError::is_retryable, &op)
                    .await
                {
                    Err(e) if e.is_table_missing() => Err(self.table_not_found()),
                    other => other,
                }
            }
            Err(e) if e.is_table_missing() => Err(self.table_not_found()),
            other => other,
        }
    }

    fn table_not_found(&self) -> QueueError {
        QueueError::TableNotFound {
            table: self.config.table_name.clone(),
        }
    }

    /// Instants bound to the pollable filter: `(redeliver_limit, now)`.
    fn pollable_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - self.redeliver_timeout, now)
    }

    async fn try_send(&self, envelope: &Envelope, headers: &str, delay: chrono::Duration) -> Result<i64> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(&self.statements.insert)
            .bind(&envelope.body)
            .bind(headers)
            .bind(&self.config.queue_name)
            .bind(now)
            .bind(now + delay)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn try_poll(&self) -> Result<Option<QueueMessage>> {
        let (redeliver_limit, now) = self.pollable_window();

        let mut tx = self.pool.begin().await?;

        let row: Option<MessageRow> = sqlx::query_as(&self.statements.select_for_poll)
            .bind(&self.config.queue_name)
            .bind(redeliver_limit)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(mut row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        // A row that can never be decoded is dropped instead of claimed
        let headers = match decode_headers(&row.headers) {
            Ok(headers) => headers,
            Err(e) => {
                sqlx::query(&self.statements.delete)
                    .bind(row.id)
                    .bind(&self.config.queue_name)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                EngineMetrics::record_rejected(BACKEND);
                tracing::warn!(
                    queue = %self.config.queue_name,
                    message_id = row.id,
                    error = %e,
                    "Rejected undecodable message"
                );
                return Err(e);
            }
        };

        sqlx::query(&self.statements.mark_delivered)
            .bind(now)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        // The claim must be durable before the row is handed out
        tx.commit().await?;

        row.delivered_at = Some(now);
        Ok(Some(row.with_headers(headers)))
    }

    async fn try_delete(&self, id: i64) -> Result<u64> {
        let result = sqlx::query(&self.statements.delete)
            .bind(id)
            .bind(&self.config.queue_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn try_keepalive(&self, id: i64) -> Result<()> {
        sqlx::query(&self.statements.keepalive)
            .bind(Utc::now())
            .bind(id)
            .bind(&self.config.queue_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_count(&self) -> Result<i64> {
        let (redeliver_limit, now) = self.pollable_window();
        let count: i64 = sqlx::query_scalar(&self.statements.count)
            .bind(&self.config.queue_name)
            .bind(redeliver_limit)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn try_find(&self, id: i64) -> Result<Option<MessageRow>> {
        let row = sqlx::query_as(&self.statements.find)
            .bind(id)
            .bind(&self.config.queue_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn try_list(&self, limit: i64) -> Result<Vec<MessageRow>> {
        let (redeliver_limit, now) = self.pollable_window();
        let rows = sqlx::query_as(&self.statements.list)
            .bind(&self.config.queue_name)
            .bind(redeliver_limit)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn try_setup(&self) -> Result<()> {
        for statement in &self.statements.setup {
            match sqlx::query(statement).execute(&self.pool).await {
                Ok(_) => {}
                // Another process won the race to create the table
                Err(sqlx::Error::Database(db))
                    if matches!(
                        db.code().as_deref(),
                        Some(PG_DUPLICATE_TABLE | PG_UNIQUE_VIOLATION)
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete the row; numeric ids only, anything else cannot be ours.
    async fn remove(&self, operation: &str, id: &MessageId) -> Result<bool> {
        let Some(numeric) = id.as_i64() else {
            tracing::debug!(message_id = %id, "Ignoring non-numeric message id");
            return Ok(false);
        };
        let deleted = self.run(operation, || self.try_delete(numeric)).await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl QueueEngine for PostgresQueueEngine {
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
        let headers = serde_json::to_string(&envelope.headers)?;
        let delay = to_time_delta(delay)?;

        let id = self
            .run("postgres.send", || self.try_send(envelope, &headers, delay))
            .await?;

        EngineMetrics::record_sent(BACKEND);
        tracing::trace!(
            table = %self.config.table_name,
            queue = %self.config.queue_name,
            message_id = id,
            "Message inserted"
        );

        Ok(MessageId::from(id))
    }

    async fn poll(&self) -> Result<Option<QueueMessage>> {
        let Some(message) = self.run("postgres.poll", || self.try_poll()).await? else {
            return Ok(None);
        };

        EngineMetrics::record_received(BACKEND);
        tracing::debug!(
            queue = %self.config.queue_name,
            message_id = %message.id,
            "Message claimed"
        );

        Ok(Some(message))
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        if self.remove("postgres.ack", id).await? {
            EngineMetrics::record_acked(BACKEND);
        }
        Ok(())
    }

    async fn reject(&self, id: &MessageId) -> Result<()> {
        if self.remove("postgres.reject", id).await? {
            EngineMetrics::record_rejected(BACKEND);
        }
        Ok(())
    }

    async fn keepalive(&self, id: &MessageId, extend: Option<Duration>) -> Result<()> {
        check_keepalive(extend, self.config.redeliver_timeout)?;

        let Some(numeric) = id.as_i64() else {
            return Ok(());
        };
        self.run("postgres.keepalive", || self.try_keepalive(numeric))
            .await
    }

    async fn count(&self) -> Result<u64> {
        let count = self.run("postgres.count", || self.try_count()).await?;
        Ok(count.max(0) as u64)
    }

    async fn setup(&self) -> Result<()> {
        retry_with_backoff(
            &self.config.retry,
            "postgres.setup",
            QueueError::is_retryable,
            || self.try_setup(),
        )
        .await?;

        tracing::info!(table = %self.config.table_name, "Queue table ready");
        Ok(())
    }
}

#[async_trait]
impl ListableQueue for PostgresQueueEngine {
    async fn find(&self, id: &MessageId) -> Result<Option<QueueMessage>> {
        let Some(numeric) = id.as_i64() else {
            return Ok(None);
        };
        self.run("postgres.find", || self.try_find(numeric))
            .await?
            .map(MessageRow::into_message)
            .transpose()
    }

    async fn list(&self, limit: usize) -> Result<Vec<QueueMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run("postgres.list", || self.try_list(limit))
            .await?
            .into_iter()
            .map(MessageRow::into_message)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_statement_skips_locked_rows() {
        let statements = Statements::new("messenger_messages", true);
        assert!(statements.select_for_poll.ends_with("FOR UPDATE SKIP LOCKED"));
        assert!(statements
            .select_for_poll
            .contains("delivered_at IS NULL OR delivered_at < $2"));
        assert!(statements.select_for_poll.contains("LIMIT 1"));
    }

    #[test]
    fn test_poll_statement_blocking_fallback() {
        let statements = Statements::new("messenger_messages", false);
        assert!(statements.select_for_poll.ends_with("FOR UPDATE"));
        assert!(!statements.select_for_poll.contains("SKIP LOCKED"));
    }

    #[test]
    fn test_keepalive_only_refreshes_own_claims() {
        let statements = Statements::new("messenger_messages", true);
        assert!(statements.keepalive.contains("queue_name = $3"));
        assert!(statements.keepalive.ends_with("delivered_at IS NOT NULL"));
        assert_ne!(statements.keepalive, statements.mark_delivered);
    }

    #[test]
    fn test_corrupt_headers_are_a_decode_error() {
        assert!(matches!(decode_headers("{not json"), Err(QueueError::Decode(_))));
        assert!(matches!(decode_headers(r#"{"n":1}"#), Err(QueueError::Decode(_))));
        assert_eq!(decode_headers(r#"{"a":"b"}"#).unwrap()["a"], "b");
    }

    #[test]
    fn test_insert_returns_id() {
        let statements = Statements::new("messenger_messages", true);
        assert!(statements.insert.ends_with("RETURNING id"));
    }

    #[test]
    fn test_schema_qualified_index_names() {
        let statements = Statements::new("queue.messages", true);
        assert!(statements.setup[0].starts_with("CREATE TABLE IF NOT EXISTS queue.messages"));
        assert!(statements.setup[1]
            .contains("messages_queue_name_idx ON queue.messages (queue_name)"));
        assert_eq!(statements.setup.len(), 4);
    }

    #[test]
    fn test_row_conversion_decodes_headers() {
        let now = Utc::now();
        let row = MessageRow {
            id: 9,
            body: "{}".to_string(),
            headers: r#"{"type":"OrderPlaced"}"#.to_string(),
            queue_name: "default".to_string(),
            created_at: now,
            available_at: now,
            delivered_at: None,
        };

        let message = row.into_message().unwrap();
        assert_eq!(message.id.as_str(), "9");
        assert_eq!(message.headers["type"], "OrderPlaced");
    }

    #[tokio::test]
    async fn test_invalid_table_name_fails_construction() {
        let pool = PostgresPool::from_pool(
            sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/queue")
                .unwrap(),
            "postgres://localhost/queue",
        );
        let config = PostgresQueueConfig {
            table_name: "messages; DROP TABLE users".to_string(),
            ..Default::default()
        };

        let result = PostgresQueueEngine::new(config, &pool);
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }
}
