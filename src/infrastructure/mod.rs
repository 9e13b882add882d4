//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool
//! - `retry`: Exponential backoff and the transient-error retry helper

pub mod postgres;
pub mod redis;
pub mod retry;

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
