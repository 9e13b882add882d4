//! PostgreSQL persistence module.
//!
//! Provides connection pooling for the relational queue engine.

pub mod pool;

pub use pool::PostgresPool;
