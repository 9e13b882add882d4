//! Queue engine semantics
//!
//! The in-memory engine runs everywhere. The PostgreSQL and Redis engines
//! run the same scenarios when `TEST_DATABASE_URL` / `TEST_REDIS_URL` point
//! at live servers, and are skipped otherwise.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use uuid::Uuid;

use reliable_queue::config::PostgresTransportSettings;
use reliable_queue::error::QueueError;
use reliable_queue::infrastructure::postgres::PostgresPool;
use reliable_queue::infrastructure::redis::RedisPool;
use reliable_queue::transport::{
    Envelope, ListableQueue, MemoryQueueConfig, MemoryQueueEngine, MemoryStore,
    PostgresQueueConfig, PostgresQueueEngine, QueueEngine, RedisQueueConfig, RedisQueueEngine,
};

const TIMEOUT: Duration = Duration::from_secs(1);

fn memory_pair(queue: &str) -> (Arc<MemoryQueueEngine>, Arc<MemoryQueueEngine>) {
    let store = Arc::new(MemoryStore::new());
    let config = MemoryQueueConfig::new(queue, TIMEOUT);
    (
        Arc::new(MemoryQueueEngine::with_store(config.clone(), store.clone()).unwrap()),
        Arc::new(MemoryQueueEngine::with_store(config, store).unwrap()),
    )
}

// ============================================================================
// Scenarios shared by every engine
// ============================================================================

/// Claim, abandon, redeliver to a second consumer, ack.
async fn abandoned_claim_is_redelivered(first: &dyn QueueEngine, second: &dyn QueueEngine) {
    let id = assert_ok!(first.send(&Envelope::new("job"), Duration::ZERO).await);

    let claimed = first.poll().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert!(claimed.delivered_at.is_some());

    // Still claimed
    assert!(second.poll().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let redelivered = second.poll().await.unwrap().unwrap();
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.body, "job");

    assert_ok!(second.ack(&id).await);
    assert_eq!(second.count().await.unwrap(), 0);
}

async fn ack_and_reject_are_idempotent(engine: &dyn QueueEngine) {
    let keep = engine.send(&Envelope::new("keep"), Duration::ZERO).await.unwrap();
    let dropped = engine.send(&Envelope::new("drop"), Duration::ZERO).await.unwrap();

    assert_ok!(engine.ack(&dropped).await);
    assert_ok!(engine.ack(&dropped).await);
    assert_ok!(engine.reject(&dropped).await);

    let remaining = engine.poll().await.unwrap().unwrap();
    assert_eq!(remaining.id, keep);
    assert!(engine.poll().await.unwrap().is_none());
    assert_ok!(engine.reject(&keep).await);
}

async fn delayed_message_waits(engine: &dyn QueueEngine) {
    engine
        .send(&Envelope::new("later"), Duration::from_millis(300))
        .await
        .unwrap();
    assert!(engine.poll().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let message = engine.poll().await.unwrap().unwrap();
    assert_eq!(message.body, "later");
    engine.ack(&message.id).await.unwrap();
}

async fn keepalive_suppresses_redelivery(first: &dyn QueueEngine, second: &dyn QueueEngine) {
    let id = first.send(&Envelope::new("slow"), Duration::ZERO).await.unwrap();
    first.poll().await.unwrap().unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_ok!(first.keepalive(&id, None).await);
        assert!(second.poll().await.unwrap().is_none());
    }

    let result = first.keepalive(&id, Some(Duration::from_secs(5))).await;
    assert!(matches!(
        result,
        Err(QueueError::KeepaliveExceedsTimeout { .. })
    ));

    first.ack(&id).await.unwrap();
}

async fn keepalive_leaves_unclaimed_message_pollable(engine: &dyn QueueEngine) {
    let id = engine.send(&Envelope::new("idle"), Duration::ZERO).await.unwrap();
    assert_ok!(engine.keepalive(&id, None).await);

    assert_eq!(engine.count().await.unwrap(), 1);
    let message = engine.poll().await.unwrap().expect("message still pollable");
    assert_eq!(message.id, id);

    engine.ack(&id).await.unwrap();
}

// ============================================================================
// In-memory engine
// ============================================================================

#[tokio::test]
async fn test_memory_abandoned_claim_is_redelivered() {
    let (first, second) = memory_pair("jobs");
    abandoned_claim_is_redelivered(first.as_ref(), second.as_ref()).await;
}

#[tokio::test]
async fn test_memory_ack_and_reject_are_idempotent() {
    let (engine, _) = memory_pair("jobs");
    ack_and_reject_are_idempotent(engine.as_ref()).await;
}

#[tokio::test]
async fn test_memory_delayed_message_waits() {
    let (engine, _) = memory_pair("jobs");
    delayed_message_waits(engine.as_ref()).await;
}

#[tokio::test]
async fn test_memory_keepalive_suppresses_redelivery() {
    let (first, second) = memory_pair("jobs");
    keepalive_suppresses_redelivery(first.as_ref(), second.as_ref()).await;
}

#[tokio::test]
async fn test_memory_keepalive_leaves_unclaimed_message_pollable() {
    let (first, _) = memory_pair("jobs");
    keepalive_leaves_unclaimed_message_pollable(first.as_ref()).await;
}

#[tokio::test]
async fn test_memory_queue_isolation() {
    let store = Arc::new(MemoryStore::new());
    let orders =
        MemoryQueueEngine::with_store(MemoryQueueConfig::new("orders", TIMEOUT), store.clone())
            .unwrap();
    let emails =
        MemoryQueueEngine::with_store(MemoryQueueConfig::new("emails", TIMEOUT), store.clone())
            .unwrap();

    orders.send(&Envelope::new("order"), Duration::ZERO).await.unwrap();

    assert!(emails.poll().await.unwrap().is_none());
    assert_eq!(emails.count().await.unwrap(), 0);
    assert_eq!(orders.poll().await.unwrap().unwrap().body, "order");
    assert_eq!(store.total_messages(), 1);
}

#[tokio::test]
async fn test_memory_concurrent_polls_never_share_a_message() {
    let (first, second) = memory_pair("jobs");
    for i in 0..200 {
        first
            .send(&Envelope::new(format!("job-{i}")), Duration::ZERO)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for engine in [first.clone(), second.clone(), first, second] {
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(message) = engine.poll().await.unwrap() {
                claimed.push(message.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "message claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test]
async fn test_memory_list_and_find_do_not_claim() {
    let (engine, _) = memory_pair("jobs");
    let a = engine.send(&Envelope::new("a"), Duration::ZERO).await.unwrap();
    engine.send(&Envelope::new("b"), Duration::ZERO).await.unwrap();

    let listed = engine.list(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, a);
    assert_eq!(engine.find(&a).await.unwrap().unwrap().body, "a");

    assert_eq!(engine.poll().await.unwrap().unwrap().id, a);
    assert_eq!(engine.list(10).await.unwrap().len(), 1);
}

// ============================================================================
// PostgreSQL engine (TEST_DATABASE_URL)
// ============================================================================

struct PostgresFixture {
    pool: PostgresPool,
    table: String,
}

impl PostgresFixture {
    fn new() -> Option<Self> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let settings: PostgresTransportSettings =
            serde_json::from_value(serde_json::json!({ "url": url })).unwrap();
        Some(Self {
            pool: PostgresPool::connect_lazy(&settings).unwrap(),
            table: format!("queue_test_{}", Uuid::new_v4().simple()),
        })
    }

    fn engine(&self, queue: &str) -> PostgresQueueEngine {
        let config = PostgresQueueConfig {
            table_name: self.table.clone(),
            queue_name: queue.to_string(),
            redeliver_timeout: TIMEOUT,
            ..Default::default()
        };
        PostgresQueueEngine::new(config, &self.pool).unwrap()
    }

    async fn drop_table(&self) {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table))
            .execute(self.pool.pool())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_postgres_engine_semantics() {
    let Some(fixture) = PostgresFixture::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    // auto_setup creates the table on first use
    let first = fixture.engine("jobs");
    let second = fixture.engine("jobs");
    abandoned_claim_is_redelivered(&first, &second).await;
    ack_and_reject_are_idempotent(&first).await;
    delayed_message_waits(&first).await;
    keepalive_suppresses_redelivery(&first, &second).await;
    keepalive_leaves_unclaimed_message_pollable(&first).await;

    let other = fixture.engine("other");
    let id = first.send(&Envelope::new("mine"), Duration::ZERO).await.unwrap();
    assert!(other.poll().await.unwrap().is_none());
    // Another queue sharing the table cannot touch this row
    assert_ok!(other.keepalive(&id, None).await);
    assert_eq!(first.list(10).await.unwrap().len(), 1);

    fixture.drop_table().await;
}

#[tokio::test]
async fn test_postgres_missing_table_without_auto_setup() {
    let Some(fixture) = PostgresFixture::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let config = PostgresQueueConfig {
        table_name: fixture.table.clone(),
        auto_setup: false,
        ..Default::default()
    };
    let engine = PostgresQueueEngine::new(config, &fixture.pool).unwrap();

    let err = engine.poll().await.unwrap_err();
    assert!(err.is_table_missing());

    engine.setup().await.unwrap();
    engine.setup().await.unwrap();
    assert!(engine.poll().await.unwrap().is_none());

    fixture.drop_table().await;
}

#[tokio::test]
async fn test_postgres_undecodable_row_is_rejected() {
    let Some(fixture) = PostgresFixture::new() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let engine = fixture.engine("jobs");
    engine.setup().await.unwrap();
    sqlx::query(&format!(
        "INSERT INTO {} (body, headers, queue_name, created_at, available_at) \
         VALUES ('{{}}', '{{broken', 'jobs', NOW(), NOW())",
        fixture.table
    ))
    .execute(fixture.pool.pool())
    .await
    .unwrap();

    let err = engine.poll().await.unwrap_err();
    assert!(matches!(err, QueueError::Decode(_)));

    // Removed, not left claimed for redelivery
    assert_eq!(engine.count().await.unwrap(), 0);
    assert!(engine.list(10).await.unwrap().is_empty());
    tokio::time::sleep(TIMEOUT + Duration::from_millis(200)).await;
    assert!(engine.poll().await.unwrap().is_none());

    fixture.drop_table().await;
}

// ============================================================================
// Redis engine (TEST_REDIS_URL)
// ============================================================================

fn redis_engine(pool: &Arc<RedisPool>, queue: &str) -> RedisQueueEngine {
    let config = RedisQueueConfig {
        redeliver_timeout: TIMEOUT,
        claim_interval: Duration::ZERO,
        ..RedisQueueConfig::new(queue)
    };
    RedisQueueEngine::new(config, pool.clone()).unwrap()
}

fn redis_pool() -> Option<Arc<RedisPool>> {
    let url = std::env::var("TEST_REDIS_URL").ok()?;
    Some(Arc::new(RedisPool::new(&url).unwrap()))
}

#[tokio::test]
async fn test_redis_engine_semantics() {
    let Some(pool) = redis_pool() else {
        eprintln!("TEST_REDIS_URL not set, skipping");
        return;
    };
    let queue = format!("queue-test:{}", Uuid::new_v4().simple());

    let first = redis_engine(&pool, &queue);
    let second = redis_engine(&pool, &queue);
    abandoned_claim_is_redelivered(&first, &second).await;
    ack_and_reject_are_idempotent(&first).await;
    delayed_message_waits(&first).await;
    keepalive_suppresses_redelivery(&first, &second).await;
    keepalive_leaves_unclaimed_message_pollable(&first).await;
    assert_eq!(first.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_redis_ring_buffer_drops_oldest() {
    let Some(pool) = redis_pool() else {
        eprintln!("TEST_REDIS_URL not set, skipping");
        return;
    };
    let config = RedisQueueConfig {
        queue_max_entries: 2,
        ..RedisQueueConfig::new(format!("queue-test:{}", Uuid::new_v4().simple()))
    };
    let engine = RedisQueueEngine::new(config, pool).unwrap();

    for body in ["one", "two", "three"] {
        engine.send(&Envelope::new(body), Duration::ZERO).await.unwrap();
    }
    assert_eq!(engine.count().await.unwrap(), 2);

    let oldest_kept = engine.poll().await.unwrap().unwrap();
    assert_eq!(oldest_kept.body, "two");
    engine.ack(&oldest_kept.id).await.unwrap();

    let last = engine.poll().await.unwrap().unwrap();
    engine.ack(&last.id).await.unwrap();
    assert_eq!(engine.count().await.unwrap(), 0);
}
