use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::error::Result;
use crate::metrics::FailoverMetrics;
use crate::transport::{Provenance, ReceivedEnvelope};

use super::backends::FailoverBackends;
use super::circuit_breaker::CircuitBreakerRegistry;
use super::strategy::ConsumptionStrategy;

/// Polls one strategy-selected backend per call.
///
/// A failing poll is recorded on the breaker and reported as "nothing
/// available"; the next call selects again. Acks, rejects and keepalives go
/// to the backend named in the envelope's provenance.
pub struct FailoverReceiver {
    transport: String,
    backends: Arc<FailoverBackends>,
    breaker: Arc<CircuitBreakerRegistry>,
    strategy: Arc<dyn ConsumptionStrategy>,
}

impl FailoverReceiver {
    pub fn new(
        transport: impl Into<String>,
        backends: Arc<FailoverBackends>,
        breaker: Arc<CircuitBreakerRegistry>,
        strategy: Arc<dyn ConsumptionStrategy>,
    ) -> Self {
        Self {
            transport: transport.into(),
            backends,
            breaker,
            strategy,
        }
    }

    pub async fn receive(&self) -> Result<Option<ReceivedEnvelope>> {
        let Some(name) = self
            .strategy
            .select_backend(self.backends.names(), &self.breaker)
        else {
            tracing::debug!(transport = %self.transport, "Every circuit is open, nothing polled");
            return Ok(None);
        };
        let engine = self.backends.require(name)?;

        let started = Instant::now();
        let result = engine.poll().await;
        let latency = started.elapsed();

        match result {
            Ok(message) => {
                self.breaker.record_success(name);
                self.strategy.record_result(name, true, latency);
                FailoverMetrics::observe_latency(&self.transport, "receive", latency);

                Ok(message.map(|message| {
                    let (id, envelope) = message.into_parts();
                    tracing::trace!(
                        transport = %self.transport,
                        backend = %name,
                        message_id = %id,
                        "Message received"
                    );
                    ReceivedEnvelope::new(envelope, Provenance::new(name, id))
                }))
            }
            Err(e) => {
                self.breaker.record_failure(name, &e);
                self.strategy.record_result(name, false, latency);
                FailoverMetrics::record_poll_error(&self.transport);
                tracing::warn!(
                    transport = %self.transport,
                    backend = %name,
                    error = %e,
                    "Poll failed, returning empty"
                );
                Ok(None)
            }
        }
    }

    pub async fn ack(&self, received: &ReceivedEnvelope) -> Result<()> {
        let provenance = received.provenance();
        self.backends
            .require(&provenance.backend)?
            .ack(&provenance.message_id)
            .await
    }

    pub async fn reject(&self, received: &ReceivedEnvelope) -> Result<()> {
        let provenance = received.provenance();
        self.backends
            .require(&provenance.backend)?
            .reject(&provenance.message_id)
            .await
    }

    pub async fn keepalive(
        &self,
        received: &ReceivedEnvelope,
        extend: Option<Duration>,
    ) -> Result<()> {
        let provenance = received.provenance();
        self.backends
            .require(&provenance.backend)?
            .keepalive(&provenance.message_id, extend)
            .await
    }

    /// Sum of the backend counts. Unreachable backends are skipped; the
    /// error is returned only if no backend answered.
    pub async fn count(&self) -> Result<u64> {
        let results = join_all(
            self.backends
                .iter()
                .map(|(name, engine)| async move { (name, engine.count().await) }),
        )
        .await;

        let mut total = 0;
        let mut answered = false;
        let mut last_error = None;
        for (name, result) in results {
            match result {
                Ok(count) => {
                    total += count;
                    answered = true;
                }
                Err(e) => {
                    tracing::warn!(
                        transport = %self.transport,
                        backend = %name,
                        error = %e,
                        "Count failed, skipping backend"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(total),
        }
    }

    /// Set up every backend; the first error is returned after all ran.
    pub async fn setup(&self) -> Result<()> {
        let results = join_all(
            self.backends
                .iter()
                .map(|(name, engine)| async move { (name, engine.setup().await) }),
        )
        .await;

        let mut first_error = None;
        for (name, result) in results {
            if let Err(e) = result {
                tracing::error!(transport = %self.transport, backend = %name, error = %e, "Setup failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
