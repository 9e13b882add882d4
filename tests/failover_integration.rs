//! Failover integration tests
//!
//! These tests compose in-memory engines behind a failover transport and
//! inject failures through a wrapping engine, so no Redis or PostgreSQL
//! instance is needed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};

use reliable_queue::config::{SendOrder, StrategyKind};
use reliable_queue::error::{QueueError, Result};
use reliable_queue::failover::{
    strategy_for, CircuitBreakerConfig, CircuitState, FailoverTransport, RoundRobin,
    WeightedRoundRobin,
};
use reliable_queue::transport::{
    Envelope, MemoryQueueConfig, MemoryQueueEngine, MessageId, QueueEngine, QueueMessage,
    Transport,
};

/// Memory engine whose sends and polls can be switched to fail.
struct FlakyEngine {
    inner: MemoryQueueEngine,
    fail_send: AtomicBool,
    fail_poll: AtomicBool,
    sends: AtomicU32,
    polls: AtomicU32,
    acks: AtomicU32,
}

impl FlakyEngine {
    fn new(queue: &str) -> Arc<Self> {
        let config = MemoryQueueConfig::new(queue, Duration::from_secs(60));
        Arc::new(Self {
            inner: MemoryQueueEngine::new(config).unwrap(),
            fail_send: AtomicBool::new(false),
            fail_poll: AtomicBool::new(false),
            sends: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            acks: AtomicU32::new(0),
        })
    }

    fn failing(queue: &str) -> Arc<Self> {
        let engine = Self::new(queue);
        engine.set_failing(true);
        engine
    }

    fn set_failing(&self, failing: bool) {
        self.fail_send.store(failing, Ordering::SeqCst);
        self.fail_poll.store(failing, Ordering::SeqCst);
    }

    fn unavailable() -> QueueError {
        QueueError::Unavailable("injected failure".to_string())
    }
}

#[async_trait]
impl QueueEngine for FlakyEngine {
    fn backend_type(&self) -> &'static str {
        "flaky"
    }

    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    fn redeliver_timeout(&self) -> Duration {
        self.inner.redeliver_timeout()
    }

    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<MessageId> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.send(envelope, delay).await
    }

    async fn poll(&self) -> Result<Option<QueueMessage>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_poll.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.poll().await
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        self.inner.ack(id).await
    }

    async fn reject(&self, id: &MessageId) -> Result<()> {
        self.inner.reject(id).await
    }

    async fn keepalive(&self, id: &MessageId, extend: Option<Duration>) -> Result<()> {
        self.inner.keepalive(id, extend).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn setup(&self) -> Result<()> {
        self.inner.setup().await
    }
}

fn breaker_config(threshold: u32, cooldown: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        cooldown,
    }
}

fn failover(
    first: &Arc<FlakyEngine>,
    second: &Arc<FlakyEngine>,
    breaker: CircuitBreakerConfig,
) -> FailoverTransport {
    FailoverTransport::new(
        "main",
        vec![
            ("first".to_string(), first.clone() as Arc<dyn QueueEngine>),
            ("second".to_string(), second.clone() as Arc<dyn QueueEngine>),
        ],
        breaker,
        Arc::new(RoundRobin::new()),
        SendOrder::Declared,
    )
    .unwrap()
}

#[tokio::test]
async fn test_send_fails_over_and_ack_routes_back() {
    let first = FlakyEngine::new("q");
    let second = FlakyEngine::new("q");
    first.fail_send.store(true, Ordering::SeqCst);
    let transport = failover(&first, &second, breaker_config(5, Duration::from_secs(60)));

    let provenance = assert_ok!(transport.send(&Envelope::new("payload"), Duration::ZERO).await);
    assert_eq!(provenance.backend, "second");
    assert_eq!(first.count().await.unwrap(), 0);
    assert_eq!(second.count().await.unwrap(), 1);

    // Round robin polls "first" (empty), then "second"
    assert!(transport.receive().await.unwrap().is_none());
    let received = transport.receive().await.unwrap().unwrap();
    assert_eq!(received.provenance().backend, "second");
    assert_eq!(received.message_id(), &provenance.message_id);
    assert_eq!(received.envelope().body, "payload");

    assert_ok!(transport.ack(&received).await);
    assert_eq!(second.acks.load(Ordering::SeqCst), 1);
    assert_eq!(first.acks.load(Ordering::SeqCst), 0);
    assert_eq!(transport.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_all_transports_failed() {
    let first = FlakyEngine::failing("q");
    let second = FlakyEngine::failing("q");
    let transport = failover(&first, &second, breaker_config(5, Duration::from_secs(60)));

    let err = assert_err!(transport.send(&Envelope::new("payload"), Duration::ZERO).await);
    match err {
        QueueError::AllTransportsFailed { attempted, source } => {
            assert_eq!(attempted, vec!["first", "second"]);
            assert!(matches!(*source, QueueError::Unavailable(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_no_available_transports_once_circuits_open() {
    let first = FlakyEngine::failing("q");
    let second = FlakyEngine::failing("q");
    let transport = failover(&first, &second, breaker_config(1, Duration::from_secs(60)));

    // One failure per backend opens both circuits
    assert_err!(transport.send(&Envelope::new("a"), Duration::ZERO).await);

    let err = assert_err!(transport.send(&Envelope::new("b"), Duration::ZERO).await);
    assert!(matches!(err, QueueError::NoAvailableTransports));
    assert_eq!(first.sends.load(Ordering::SeqCst), 1);
    assert_eq!(second.sends.load(Ordering::SeqCst), 1);

    // Receive does not touch open backends and reports nothing
    assert!(transport.receive().await.unwrap().is_none());
    assert_eq!(first.polls.load(Ordering::SeqCst), 0);
    assert_eq!(second.polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_poll_returns_empty_and_opens_circuit() {
    let first = FlakyEngine::new("q");
    let second = FlakyEngine::new("q");
    first.fail_poll.store(true, Ordering::SeqCst);
    let transport = failover(&first, &second, breaker_config(1, Duration::from_secs(60)));

    assert_ok!(second.send(&Envelope::new("payload"), Duration::ZERO).await);

    // First poll hits the failing backend and comes back empty
    assert!(assert_ok!(transport.receive().await).is_none());
    assert_eq!(transport.breaker().state("first"), CircuitState::Open);

    // Every following poll goes to the healthy backend
    let received = transport.receive().await.unwrap().unwrap();
    assert_eq!(received.provenance().backend, "second");
    assert!(transport.receive().await.unwrap().is_none());
    assert_eq!(first.polls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_circuit_recovers_after_cooldown() {
    let first = FlakyEngine::failing("q");
    let second = FlakyEngine::new("q");
    let transport = failover(&first, &second, breaker_config(2, Duration::from_millis(50)));

    for _ in 0..2 {
        let provenance = transport
            .send(&Envelope::new("payload"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(provenance.backend, "second");
    }
    assert_eq!(transport.breaker().state("first"), CircuitState::Open);

    // While open, "first" is not attempted
    transport
        .send(&Envelope::new("payload"), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(first.sends.load(Ordering::SeqCst), 2);

    first.set_failing(false);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let provenance = transport
        .send(&Envelope::new("payload"), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(provenance.backend, "first");
    assert_eq!(transport.breaker().state("first"), CircuitState::Closed);
    assert_eq!(transport.breaker().failure_count("first"), 0);

    let snapshot = transport.breaker_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|stats| stats.state == CircuitState::Closed));
}

#[tokio::test]
async fn test_round_robin_receive_is_fair() {
    let engines: Vec<Arc<FlakyEngine>> = (0..3).map(|_| FlakyEngine::new("q")).collect();
    let transport = FailoverTransport::new(
        "main",
        engines
            .iter()
            .enumerate()
            .map(|(i, engine)| (format!("backend-{i}"), engine.clone() as Arc<dyn QueueEngine>))
            .collect(),
        breaker_config(5, Duration::from_secs(60)),
        strategy_for(StrategyKind::RoundRobin),
        SendOrder::Declared,
    )
    .unwrap();

    for _ in 0..12 {
        transport.receive().await.unwrap();
    }
    for engine in &engines {
        assert_eq!(engine.polls.load(Ordering::SeqCst), 4);
    }
}

#[tokio::test]
async fn test_strategy_send_order_prefers_healthy_backend() {
    let first = FlakyEngine::failing("q");
    let second = FlakyEngine::new("q");
    let transport = FailoverTransport::new(
        "main",
        vec![
            ("first".to_string(), first.clone() as Arc<dyn QueueEngine>),
            ("second".to_string(), second.clone() as Arc<dyn QueueEngine>),
        ],
        breaker_config(1_000, Duration::from_secs(60)),
        Arc::new(WeightedRoundRobin::new()),
        SendOrder::Strategy,
    )
    .unwrap();

    for _ in 0..200 {
        let provenance = transport
            .send(&Envelope::new("payload"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(provenance.backend, "second");
    }

    // The failing backend's weight decays, so it is tried far less often
    assert!(first.sends.load(Ordering::SeqCst) < 100);
    assert_eq!(second.count().await.unwrap(), 200);
}

#[tokio::test]
async fn test_keepalive_and_reject_route_by_provenance() {
    let first = FlakyEngine::new("q");
    let second = FlakyEngine::new("q");
    let transport = failover(&first, &second, breaker_config(5, Duration::from_secs(60)));

    transport
        .send(&Envelope::new("payload"), Duration::ZERO)
        .await
        .unwrap();
    let received = transport.receive().await.unwrap().unwrap();
    assert_eq!(received.provenance().backend, "first");

    assert_ok!(transport.keepalive(&received, None).await);
    let err = assert_err!(
        transport
            .keepalive(&received, Some(Duration::from_secs(120)))
            .await
    );
    assert!(matches!(err, QueueError::KeepaliveExceedsTimeout { .. }));

    assert_ok!(transport.reject(&received).await);
    assert_eq!(first.count().await.unwrap(), 0);
    assert_eq!(first.inner.store().total_messages(), 0);
}

#[tokio::test]
async fn test_envelope_from_other_transport_is_refused() {
    let transport = failover(
        &FlakyEngine::new("q"),
        &FlakyEngine::new("q"),
        breaker_config(5, Duration::from_secs(60)),
    );
    let other = FailoverTransport::new(
        "other",
        vec![
            ("x".to_string(), FlakyEngine::new("q") as Arc<dyn QueueEngine>),
            ("y".to_string(), FlakyEngine::new("q") as Arc<dyn QueueEngine>),
        ],
        breaker_config(5, Duration::from_secs(60)),
        Arc::new(RoundRobin::new()),
        SendOrder::Declared,
    )
    .unwrap();

    other
        .send(&Envelope::new("payload"), Duration::ZERO)
        .await
        .unwrap();
    let received = other.receive().await.unwrap().unwrap();

    let err = assert_err!(transport.ack(&received).await);
    assert!(matches!(err, QueueError::UnknownTransport(name) if name == "x"));
}

#[test]
fn test_failover_needs_two_backends() {
    let result = FailoverTransport::new(
        "main",
        vec![("only".to_string(), FlakyEngine::new("q") as Arc<dyn QueueEngine>)],
        breaker_config(5, Duration::from_secs(60)),
        Arc::new(RoundRobin::new()),
        SendOrder::Declared,
    );
    assert!(matches!(
        result,
        Err(QueueError::NotEnoughTransports { given: 1 })
    ));
}
