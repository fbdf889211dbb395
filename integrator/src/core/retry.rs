// =============================================================================
// UPLOAD RETRY BEHAVIOR
// =============================================================================
//
// Uploads are the only operation in the pipeline that talks to a remote
// service, so they are the only one that retries. Two pieces control it:
//
// 1. RETRY POLICY: how many attempts and how long to wait between them.
// 2. RETRYABLE TRAIT: which errors are transient.
//
// A permanent error (payload rejected, unauthorized) stops immediately even
// when attempts remain. Everything else backs off exponentially.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Configuration for retry attempts and backoff.
///
/// # Examples
///
/// ```
/// use integrator::core::RetryPolicy;
/// use std::time::Duration;
///
/// const UPLOAD_RETRY: RetryPolicy = RetryPolicy {
///     max_attempts: 5,
///     initial_delay: Duration::from_millis(200),
///     max_delay: Duration::from_secs(5),
///     backoff_multiplier: 2.0,
/// };
///
/// assert_eq!(UPLOAD_RETRY.delay_for_attempt(1), Some(Duration::from_millis(200)));
/// assert_eq!(UPLOAD_RETRY.delay_for_attempt(5), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap on the exponential backoff.
    pub max_delay: Duration,

    /// Each retry delay is `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// No retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// 3 attempts, 1s initial delay doubling up to 30s.
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// 10 attempts, 100ms initial delay growing 1.5x up to 10s.
    pub const AGGRESSIVE: Self = Self {
        max_attempts: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 1.5,
    };

    /// Standard delays with a custom attempt count.
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Returns the delay before retrying after `attempt` (1-indexed), or
    /// `None` once the attempts are exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1) as f64;
        let multiplier = self.backoff_multiplier.powf(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        Some(Duration::from_secs_f64(
            delay_secs.min(self.max_delay.as_secs_f64()),
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl From<u32> for RetryPolicy {
    fn from(max_attempts: u32) -> Self {
        Self::with_max_attempts(max_attempts)
    }
}

// =============================================================================
// RETRYABLE
// =============================================================================

/// Classifies errors as transient or permanent.
///
/// ```
/// use integrator::core::Retryable;
///
/// #[derive(Debug)]
/// enum ApiError {
///     Timeout,
///     PayloadTooLarge,
/// }
///
/// impl Retryable for ApiError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, ApiError::Timeout)
///     }
/// }
///
/// assert!(ApiError::Timeout.is_retryable());
/// assert!(!ApiError::PayloadTooLarge.is_retryable());
/// ```
pub trait Retryable {
    /// Returns true if the operation should be attempted again.
    fn is_retryable(&self) -> bool;
}

/// Runs `operation` until it succeeds, returns a non-retryable error, or the
/// policy runs out of attempts.
///
/// The closure receives the current attempt number, starting at 1.
pub async fn retry_with_policy<F, Fut, T, E>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            tracing::debug!("Operation failed with non-retryable error: {}", error);
            return Err(error);
        }

        match policy.delay_for_attempt(attempt) {
            Some(delay) => {
                tracing::debug!(
                    "Operation failed with retryable error (attempt {}/{}): {}. Retrying after {:?}",
                    attempt,
                    policy.max_attempts,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                tracing::warn!(
                    "Operation failed and exhausted retry attempts ({}/{}): {}",
                    attempt,
                    policy.max_attempts,
                    error
                );
                return Err(error);
            }
        }
    }
}
