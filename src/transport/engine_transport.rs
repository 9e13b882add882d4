//! Transport contract shared by single-backend and failover transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{QueueError, Result};

use super::backend::QueueEngine;
use super::envelope::{Envelope, Provenance, ReceivedEnvelope};

/// A named, addressable transport.
///
/// Every envelope returned by `receive` carries the provenance of the backend
/// that produced it; `ack`, `reject` and `keepalive` route by that provenance.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Configured transport name
    fn name(&self) -> &str;

    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<Provenance>;

    /// Claim at most one message. `Ok(None)` means nothing is available.
    async fn receive(&self) -> Result<Option<ReceivedEnvelope>>;

    async fn ack(&self, received: &ReceivedEnvelope) -> Result<()>;

    async fn reject(&self, received: &ReceivedEnvelope) -> Result<()>;

    async fn keepalive(&self, received: &ReceivedEnvelope, extend: Option<Duration>)
        -> Result<()>;

    async fn count(&self) -> Result<u64>;

    async fn setup(&self) -> Result<()>;
}

/// Transport over exactly one queue engine.
pub struct EngineTransport {
    name: String,
    engine: Arc<dyn QueueEngine>,
}

impl EngineTransport {
    pub fn new(name: impl Into<String>, engine: Arc<dyn QueueEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<dyn QueueEngine> {
        &self.engine
    }

    fn check_provenance<'a>(&self, received: &'a ReceivedEnvelope) -> Result<&'a Provenance> {
        let provenance = received.provenance();
        if provenance.backend != self.name {
            return Err(QueueError::UnknownTransport(provenance.backend.clone()));
        }
        Ok(provenance)
    }
}

#[async_trait]
impl Transport for EngineTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope, delay: Duration) -> Result<Provenance> {
        let id = self.engine.send(envelope, delay).await?;
        Ok(Provenance::new(self.name.clone(), id))
    }

    async fn receive(&self) -> Result<Option<ReceivedEnvelope>> {
        let Some(message) = self.engine.poll().await? else {
            return Ok(None);
        };

        let (id, envelope) = message.into_parts();
        Ok(Some(ReceivedEnvelope::new(
            envelope,
            Provenance::new(self.name.clone(), id),
        )))
    }

    async fn ack(&self, received: &ReceivedEnvelope) -> Result<()> {
        let provenance = self.check_provenance(received)?;
        self.engine.ack(&provenance.message_id).await
    }

    async fn reject(&self, received: &ReceivedEnvelope) -> Result<()> {
        let provenance = self.check_provenance(received)?;
        self.engine.reject(&provenance.message_id).await
    }

    async fn keepalive(
        &self,
        received: &ReceivedEnvelope,
        extend: Option<Duration>,
    ) -> Result<()> {
        let provenance = self.check_provenance(received)?;
        self.engine.keepalive(&provenance.message_id, extend).await
    }

    async fn count(&self) -> Result<u64> {
        self.engine.count().await
    }

    async fn setup(&self) -> Result<()> {
        self.engine.setup().await
    }
}
