//! Retry utilities with exponential backoff and jitter.
//!
//! Used for every call that may fail transiently. Each attempt re-runs the
//! whole operation closure, so callers that re-read state inside the closure
//! never write back stale data.
//!
//! # Example
//!
//! ```ignore
//! use neo4j_common::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let status = retry_with_backoff_if(
//!     &RetryConfig { max_attempts: 5, ..RetryConfig::default() },
//!     "update_status",
//!     |e: &Error| e.is_conflict(),
//!     || async { read_modify_write().await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(32) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Error returned by [`retry_with_backoff_if`]
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was not retryable; returned as soon as it was seen
    Permanent(E),
    /// Every attempt failed with a retryable error; holds the last one
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Unwrap the underlying error regardless of why retrying stopped
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter, retrying
/// only errors accepted by `should_retry`.
///
/// Non-retryable errors return immediately as [`RetryError::Permanent`];
/// running out of attempts returns [`RetryError::Exhausted`].
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(RetryError::Permanent(e)),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay =
                    Duration::from_secs_f64(config.base_delay(attempt).as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}
