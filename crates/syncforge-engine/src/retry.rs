//! Retrying executor: one async operation, a backoff policy, an attempt
//! budget and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use syncforge_types::error::FetchError;

use crate::backoff::{classify, BackoffPolicy, ErrorClass};

/// Default per-attempt timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs an operation until it succeeds, fails fatally, or the attempt budget
/// is spent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
    max_attempts: u32,
    operation_timeout: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), 3)
    }
}

impl RetryExecutor {
    /// `max_attempts` counts the first call; `1` means no retries. A budget of
    /// zero is treated as one.
    #[must_use]
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts: max_attempts.max(1),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run `operation`, retrying retryable failures.
    ///
    /// Each attempt is bounded by the operation timeout; an elapsed attempt
    /// counts as a retryable timeout failure. Emits one warning per failed
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, or the last error once the budget is
    /// exhausted.
    pub async fn execute<T, F, Fut>(&self, context: &str, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.operation_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::timeout(format!(
                    "operation timed out after {}ms",
                    self.operation_timeout.as_millis()
                ))),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classify(&err);
            if class == ErrorClass::Fatal {
                tracing::warn!(
                    context,
                    attempt,
                    max_attempts = self.max_attempts,
                    class = %class,
                    kind = %err.kind,
                    status = err.status,
                    error = %err,
                    "Fatal error, not retrying"
                );
                return Err(err);
            }
            if attempt >= self.max_attempts {
                tracing::warn!(
                    context,
                    attempt,
                    max_attempts = self.max_attempts,
                    class = %class,
                    kind = %err.kind,
                    status = err.status,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(err);
            }

            let delay = self.policy.delay_for_error(&err, attempt);
            #[allow(clippy::cast_possible_truncation)]
            let delay_ms = delay.as_millis() as u64;
            tracing::warn!(
                context,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms,
                class = %class,
                kind = %err.kind,
                status = err.status,
                error = %err,
                "Retryable error, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
