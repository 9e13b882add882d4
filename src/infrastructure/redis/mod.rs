//! Redis persistence module.
//!
//! Provides the shared multiplexed connection used by the key/sorted-set
//! queue engine.

pub mod pool;

pub use pool::RedisPool;
