//! Caller-driven retry on top of [`ServiceConnection`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ServiceConnection, ServiceError, ServiceStarter};

/// Base delay for exponential backoff (in milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 500;

/// Maximum backoff delay (in milliseconds)
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Maximum number of acquisition attempts
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "crate::config::duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::duration_millis")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
            max_attempts: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 1,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let exponential_delay = (self.base_delay.as_millis() as u64).saturating_mul(1 << exponent);
        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Acquires a handle, retrying retryable failures according to `policy`.
///
/// # Errors
///
/// - `ServiceError::RetriesExhausted` - If every allowed attempt failed
/// - Any non-retryable `ServiceError` from the connection, unchanged
pub async fn acquire_with_backoff<S: ServiceStarter>(
    connection: &ServiceConnection<S>,
    policy: &RetryPolicy,
) -> Result<S::Handle, ServiceError> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match connection.acquire().await {
            Ok(handle) => return Ok(handle),
            Err(error) if error.is_retryable() => error,
            Err(error) => return Err(error),
        };

        if !policy.should_retry(attempt) {
            return Err(ServiceError::RetriesExhausted {
                attempts: attempt,
                last_error: error.to_string(),
            });
        }

        let delay = policy.delay_for(attempt);
        tracing::debug!(
            "{}: attempt {} failed ({}), retrying in {:?}",
            connection.label(),
            attempt,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
