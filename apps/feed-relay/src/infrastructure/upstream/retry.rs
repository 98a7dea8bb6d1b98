//! Call-Site Retry Policy
//!
//! Bounded retries for one upstream call (authorize, connect). The caller
//! decides which errors are retryable, so fatal failures such as a rejected
//! credential are returned on the first attempt.
//!
//! # Retryable Statuses
//!
//! | Retryable | Non-Retryable |
//! |-----------|---------------|
//! | HTTP 408 / 429 | HTTP 400 / 404 / 422 |
//! | HTTP 5xx | HTTP 401 / 403 (credential) |
//! | Network errors, timeouts | Malformed success bodies never reach here |

use std::future::Future;
use std::time::Duration;

/// HTTP statuses worth retrying besides 5xx.
const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429];

/// Check if an HTTP status code is retryable.
#[must_use]
pub fn is_retryable_status(status_code: u16) -> bool {
    (500..600).contains(&status_code) || RETRYABLE_STATUS_CODES.contains(&status_code)
}

/// Retry configuration for a single call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(20);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    let delay = self.backoff(attempt - 1);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
