use std::future::Future;

use tokio::time::{sleep, timeout, Duration};

use crate::error::{ExchangeCallError, GatewayError};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    /// Per-attempt deadline
    pub timeout: Duration,
    /// Wait after the first failed attempt; doubles each time
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            base_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the failed attempt with 0-based index `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

/// Timeout + exponential backoff around every exchange call.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds or the attempt budget is spent.
    ///
    /// Each attempt races the call against the policy timeout. There is no
    /// sleep after the final attempt; the last error is returned wrapped in
    /// an [`ExchangeCallError`].
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<T, ExchangeCallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let result = match timeout(self.policy.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(self.policy.timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, attempts = attempt + 1, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt + 1 < attempts {
                        let backoff = self.policy.backoff(attempt);
                        tracing::warn!(
                            operation,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Exchange call failed, retrying"
                        );
                        last_error = Some(e);
                        sleep(backoff).await;
                    } else {
                        tracing::error!(
                            operation,
                            attempts,
                            error = %e,
                            "Exchange call failed, giving up"
                        );
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(ExchangeCallError {
            operation: operation.to_string(),
            attempts,
            last_error: last_error.unwrap_or(GatewayError::Timeout(self.policy.timeout)),
        })
    }
}
