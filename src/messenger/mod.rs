//! Typed producers and consumers over a [`Transport`].
//!
//! A [`Serializer`] turns application messages into envelopes and back.
//! Messages that cannot be decoded are rejected before the decode error is
//! returned, so they are neither lost silently nor redelivered forever.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QueueError, Result};
use crate::transport::{Envelope, Provenance, ReceivedEnvelope, Transport};

pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const TYPE_HEADER: &str = "type";

const JSON_CONTENT_TYPE: &str = "application/json";

pub trait Serializer: Send + Sync {
    type Message;

    fn encode(&self, message: &Self::Message) -> Result<Envelope>;

    fn decode(&self, envelope: &Envelope) -> Result<Self::Message>;
}

/// JSON body with `content-type` and `type` headers.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Envelope> {
        let body = serde_json::to_string(message)?;
        Ok(Envelope::new(body)
            .with_header(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE)
            .with_header(TYPE_HEADER, Self::type_name()))
    }

    fn decode(&self, envelope: &Envelope) -> Result<T> {
        if let Some(content_type) = envelope.header(CONTENT_TYPE_HEADER) {
            if content_type != JSON_CONTENT_TYPE {
                return Err(QueueError::Decode(format!(
                    "unsupported content type \"{content_type}\""
                )));
            }
        }
        if let Some(type_name) = envelope.header(TYPE_HEADER) {
            if type_name != Self::type_name() {
                return Err(QueueError::Decode(format!(
                    "expected message type \"{}\", got \"{type_name}\"",
                    Self::type_name()
                )));
            }
        }

        serde_json::from_str(&envelope.body).map_err(|e| QueueError::Decode(e.to_string()))
    }
}

/// Encodes messages and sends them on a transport.
pub struct Producer<S> {
    transport: Arc<dyn Transport>,
    serializer: S,
}

impl<S: Serializer> Producer<S> {
    pub fn new(transport: Arc<dyn Transport>, serializer: S) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    pub async fn send(&self, message: &S::Message) -> Result<Provenance> {
        self.send_delayed(message, Duration::ZERO).await
    }

    /// Send a message that becomes visible after `delay`.
    pub async fn send_delayed(&self, message: &S::Message, delay: Duration) -> Result<Provenance> {
        let envelope = self.serializer.encode(message)?;
        self.transport.send(&envelope, delay).await
    }
}

/// A decoded message together with the envelope it arrived in.
#[derive(Debug)]
pub struct Delivery<T> {
    message: T,
    received: ReceivedEnvelope,
}

impl<T> Delivery<T> {
    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn received(&self) -> &ReceivedEnvelope {
        &self.received
    }

    pub fn provenance(&self) -> &Provenance {
        self.received.provenance()
    }

    pub fn into_message(self) -> T {
        self.message
    }
}

/// Receives and decodes messages from a transport.
pub struct Consumer<S> {
    transport: Arc<dyn Transport>,
    serializer: S,
}

impl<S: Serializer> Consumer<S> {
    pub fn new(transport: Arc<dyn Transport>, serializer: S) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    /// Claim and decode one message. An undecodable message is rejected and
    /// reported as [`QueueError::Decode`].
    pub async fn receive(&self) -> Result<Option<Delivery<S::Message>>> {
        let Some(received) = self.transport.receive().await? else {
            return Ok(None);
        };

        match self.serializer.decode(received.envelope()) {
            Ok(message) => Ok(Some(Delivery { message, received })),
            Err(e) => {
                let provenance = received.provenance();
                tracing::warn!(
                    transport = %self.transport.name(),
                    backend = %provenance.backend,
                    message_id = %provenance.message_id,
                    error = %e,
                    "Rejecting undecodable message"
                );
                self.transport.reject(&received).await?;
                Err(match e {
                    QueueError::Decode(_) => e,
                    other => QueueError::Decode(other.to_string()),
                })
            }
        }
    }

    pub async fn ack(&self, delivery: &Delivery<S::Message>) -> Result<()> {
        self.transport.ack(&delivery.received).await
    }

    pub async fn reject(&self, delivery: &Delivery<S::Message>) -> Result<()> {
        self.transport.reject(&delivery.received).await
    }

    pub async fn keepalive(
        &self,
        delivery: &Delivery<S::Message>,
        extend: Option<Duration>,
    ) -> Result<()> {
        self.transport.keepalive(&delivery.received, extend).await
    }
}
