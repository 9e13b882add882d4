// Configuration and errors
pub mod config;
pub mod error;

// Infrastructure layer (pools, retry)
pub mod infrastructure;

// Queue engines and transports
pub mod failover;
pub mod messenger;
pub mod transport;

// Supporting modules
pub mod metrics;
pub mod telemetry;

pub use error::{QueueError, Result};
