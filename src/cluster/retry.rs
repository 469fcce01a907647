//! Retry-with-backoff combinator for single-attempt async calls
//!
//! Retries only transient failures (see [`Error::is_transient`]); anything
//! else is returned to the caller on first sight. Every wait honours the
//! caller's cancellation token.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often and how patiently to retry
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// Bound applied to each individual attempt
    pub attempt_timeout: Option<Duration>,
    /// Delay after the first failure; doubles per attempt
    pub base_backoff: Duration,
    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Retry until success or cancellation
    pub fn unbounded(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            attempt_timeout: None,
            base_backoff,
            max_backoff,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2_u32.pow(exponent))
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Run `attempt` until it succeeds, fails permanently, exhausts the policy,
/// or `cancel` fires.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &'static str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = run_attempt(policy.attempt_timeout, operation, attempt()) => result,
        };

        let err = match result {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            warn!(operation, attempts, "Giving up after last failure: {}", err);
            return Err(Error::TooManyRetries { attempts });
        }

        let backoff = policy.backoff_for(attempts);
        metrics::counter!(
            "flowmesh_lifecycle_retries_total",
            "operation" => operation
        )
        .increment(1);
        metrics::histogram!(
            "flowmesh_lifecycle_retry_backoff_seconds",
            "operation" => operation
        )
        .record(backoff.as_secs_f64());
        warn!(
            operation,
            attempt = attempts,
            backoff_ms = backoff.as_millis() as u64,
            "Attempt failed, retrying: {}",
            err
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

async fn run_attempt<T, Fut>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    operation: operation.to_string(),
                    after,
                })
            }),
        None => fut.await,
    }
}
