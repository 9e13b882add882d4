use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SendOrder;
use crate::error::Result;
use crate::transport::{Envelope, Provenance, QueueEngine, ReceivedEnvelope, Transport};

use super::backends::FailoverBackends;
use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats};
use super::receiver::FailoverReceiver;
use super::sender::FailoverSender;
use super::strategy::ConsumptionStrategy;

/// One logical transport over several queue engines.
///
/// The sender and receiver share one breaker registry and one strategy
/// instance, both owned here.
pub struct FailoverTransport {
    name: String,
    breaker: Arc<CircuitBreakerRegistry>,
    strategy: Arc<dyn ConsumptionStrategy>,
    sender: FailoverSender,
    receiver: FailoverReceiver,
}

impl FailoverTransport {
    pub fn new(
        name: impl Into<String>,
        backends: Vec<(String, Arc<dyn QueueEngine>)>,
        breaker_config: CircuitBreakerConfig,
        strategy: Arc<dyn ConsumptionStrategy>,
        send_order: SendOrder,
    ) -> Result<Self> {
        let name = name.into();
        let backends = Arc::new(FailoverBackends::new(backends)?);
        let breaker = Arc::new(CircuitBreakerRegistry::new(name.clone(), breaker_config));

        let sender = FailoverSender::new(
            name.clone(),
            backends.clone(),
            breaker.clone(),
            strategy.clone(),
            send_order,
        );
        let receiver =
            FailoverReceiver::new(name.clone(), backends, breaker.clone(), strategy.clone());

        Ok(Self {
            name,
            breaker,
            strategy,
            sender,
            receiver,
        })
    }

    pub fn breaker(&self) -> &CircuitBreakerRegistry {
        &self.breaker
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Breaker state and failure count of every backend used so far.
    pub fn breaker_snapshot(&self) -> Vec<CircuitBreakerStats> {
        self.breaker.snapshot()
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<Provenance> {
        self.sender.send(envelope, delay).await
    }

    async fn receive(&self) -> Result<Option<ReceivedEnvelope>> {
        self.receiver.receive().await
    }

    async fn ack(&self, received: &ReceivedEnvelope) -> Result<()> {
        self.receiver.ack(received).await
    }

    async fn reject(&self, received: &ReceivedEnvelope) -> Result<()> {
        self.receiver.reject(received).await
    }

    async fn keepalive(
        &self,
        received: &ReceivedEnvelope,
        extend: Option<Duration>,
    ) -> Result<()> {
        self.receiver.keepalive(received, extend).await
    }

    async fn count(&self) -> Result<u64> {
        self.receiver.count().await
    }

    async fn setup(&self) -> Result<()> {
        self.receiver.setup().await
    }
}

impl std::fmt::Debug for FailoverTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverTransport")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
