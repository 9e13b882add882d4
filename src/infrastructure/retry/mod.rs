//! Retry of transient failures with exponential backoff and jitter.
//!
//! Every backend operation that talks to a store goes through
//! [`retry_with_backoff`], so the retry discipline is uniform: an operation
//! closure, a predicate deciding which errors are transient, and a
//! [`RetryPolicy`] bounding the attempts.

mod backoff;

use std::future::Future;

pub use backoff::{BackoffConfig, ExponentialBackoff};

use crate::config::RetrySettings;
use crate::error::QueueError;
use crate::metrics::RetryMetrics;

/// Attempt cap plus the backoff between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    /// Policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: BackoffConfig::from(settings),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt cap is reached.
///
/// A retryable error on the last attempt is wrapped in
/// [`QueueError::RetriesExhausted`]; a non-retryable error is returned as is.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
    P: Fn(&QueueError) -> bool,
{
    let mut backoff = ExponentialBackoff::with_config(policy.backoff.clone());
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    operation = %operation,
                    attempts = attempt,
                    error = %e,
                    "Giving up after transient failures"
                );
                if max_attempts == 1 {
                    return Err(e);
                }
                return Err(QueueError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                let delay = backoff.next_delay();
                RetryMetrics::record_retry(operation);
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
