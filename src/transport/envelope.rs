//! Envelope types exchanged with transports.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::backend::MessageId;

/// Serialized message: opaque body plus string headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Envelope {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Which backend holds a message, and under which id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provenance {
    pub backend: String,
    pub message_id: MessageId,
}

impl Provenance {
    pub fn new(backend: impl Into<String>, message_id: MessageId) -> Self {
        Self {
            backend: backend.into(),
            message_id,
        }
    }
}

/// An envelope handed out by a receive operation.
///
/// Only receivers construct these, so every value carries the provenance
/// needed to route `ack`, `reject` and `keepalive` back to its backend.
#[derive(Debug, Clone)]
pub struct ReceivedEnvelope {
    envelope: Envelope,
    provenance: Provenance,
}

impl ReceivedEnvelope {
    pub(crate) fn new(envelope: Envelope, provenance: Provenance) -> Self {
        Self {
            envelope,
            provenance,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn message_id(&self) -> &MessageId {
        &self.provenance.message_id
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}
