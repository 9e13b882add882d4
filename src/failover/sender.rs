use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SendOrder;
use crate::error::{QueueError, Result};
use crate::metrics::FailoverMetrics;
use crate::transport::{Envelope, Provenance};

use super::backends::FailoverBackends;
use super::circuit_breaker::CircuitBreakerRegistry;
use super::strategy::ConsumptionStrategy;

/// Sends to the first backend that accepts the message.
///
/// Candidates whose circuit is open are skipped. A failed attempt is
/// recorded on the breaker and the next candidate is tried; every backend
/// is attempted at most once per send.
pub struct FailoverSender {
    transport: String,
    backends: Arc<FailoverBackends>,
    breaker: Arc<CircuitBreakerRegistry>,
    strategy: Arc<dyn ConsumptionStrategy>,
    order: SendOrder,
}

impl FailoverSender {
    pub fn new(
        transport: impl Into<String>,
        backends: Arc<FailoverBackends>,
        breaker: Arc<CircuitBreakerRegistry>,
        strategy: Arc<dyn ConsumptionStrategy>,
        order: SendOrder,
    ) -> Self {
        Self {
            transport: transport.into(),
            backends,
            breaker,
            strategy,
            order,
        }
    }

    fn next_candidate(&self, remaining: &[String]) -> Option<String> {
        match self.order {
            SendOrder::Declared => remaining
                .iter()
                .find(|name| self.breaker.is_available(name))
                .cloned(),
            SendOrder::Strategy => self
                .strategy
                .select_backend(remaining, &self.breaker)
                .map(str::to_string),
        }
    }

    pub async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<Provenance> {
        let mut remaining = self.backends.names().to_vec();
        let mut attempted = Vec::new();
        let mut last_error = None;

        while let Some(name) = self.next_candidate(&remaining) {
            remaining.retain(|candidate| candidate != &name);
            let engine = self.backends.require(&name)?;

            let started = Instant::now();
            let result = engine.send(envelope, delay).await;
            let latency = started.elapsed();

            match result {
                Ok(id) => {
                    self.breaker.record_success(&name);
                    self.strategy.record_result(&name, true, latency);
                    FailoverMetrics::observe_latency(&self.transport, "send", latency);
                    tracing::trace!(
                        transport = %self.transport,
                        backend = %name,
                        message_id = %id,
                        "Message sent"
                    );
                    return Ok(Provenance::new(name, id));
                }
                Err(e) if e.is_usage() => return Err(e),
                Err(e) => {
                    self.breaker.record_failure(&name, &e);
                    self.strategy.record_result(&name, false, latency);
                    FailoverMetrics::record_fallback(&self.transport);
                    tracing::warn!(
                        transport = %self.transport,
                        backend = %name,
                        error = %e,
                        "Send failed, trying next backend"
                    );
                    attempted.push(name);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(source) => {
                tracing::error!(
                    transport = %self.transport,
                    attempted = ?attempted,
                    error = %source,
                    "Send failed on every backend"
                );
                Err(QueueError::AllTransportsFailed {
                    attempted,
                    source: Box::new(source),
                })
            }
            None => {
                tracing::error!(transport = %self.transport, "No backend available for send");
                Err(QueueError::NoAvailableTransports)
            }
        }
    }
}
