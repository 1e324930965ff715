//! Bounded retry with exponential backoff for transient RPC failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MigrationResult;
use crate::runtime::call_with_timeout;

/// Retry budget applied inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "crate::types::serde_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "crate::types::serde_ms")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned verbatim.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> MigrationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MigrationResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `run` with every attempt bounded by `timeout`.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        mut op: F,
    ) -> MigrationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MigrationResult<T>>,
    {
        self.run(operation, || call_with_timeout(operation, timeout, op()))
            .await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MigrationError, RpcCode};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy(3)
            .run("ListContainers", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MigrationError::Timeout {
                        operation: "ListContainers".to_string(),
                        timeout_ms: 1,
                    })
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: MigrationResult<()> = fast_policy(2)
            .run("StartContainer", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MigrationError::RuntimeRpc {
                    operation: "StartContainer",
                    code: RpcCode::Unavailable,
                    message: "down".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: MigrationResult<()> = fast_policy(5)
            .run("CheckpointContainer", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MigrationError::RuntimeRpc {
                    operation: "CheckpointContainer",
                    code: RpcCode::Unknown,
                    message: "criu failed".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
