//! Queue engines and the transports built on them.
//!
//! - `backend`: the `QueueEngine` contract and stored message types
//! - `envelope`: envelopes and provenance stamps
//! - `postgres_backend`: row-per-message table with `SKIP LOCKED` claims
//! - `redis_backend`: ready list, delayed sorted set and claim set
//! - `memory_backend`: process-local engine with relational semantics
//! - `engine_transport`: the `Transport` contract and its single-engine form
//! - `factory`: named transports from settings

pub mod backend;
pub mod engine_transport;
pub mod envelope;
pub mod factory;
pub mod memory_backend;
pub mod models;
pub mod postgres_backend;
pub mod redis_backend;

pub use backend::{ListableQueue, MessageId, QueueEngine, QueueMessage};
pub use engine_transport::{EngineTransport, Transport};
pub use envelope::{Envelope, Provenance, ReceivedEnvelope};
pub use factory::{create_transports, TransportRegistry};
pub use memory_backend::{MemoryQueueEngine, MemoryStore};
pub use models::{MemoryQueueConfig, PostgresQueueConfig, RedisQueueConfig, MAX_QUEUE_NAME_LEN};
pub use postgres_backend::PostgresQueueEngine;
pub use redis_backend::RedisQueueEngine;
