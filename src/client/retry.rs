use crate::client::{ClientError, ClientResult};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff over retryable request failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    scale_factor_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, scale_factor_ms: u64) -> Self {
        Self {
            max_attempts,
            scale_factor_ms,
        }
    }

    /// `attempt` counts completed tries. False once the budget is spent or
    /// the error class cannot succeed on retry.
    pub fn should_retry(&self, error: &ClientError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        error.is_retryable()
    }

    /// Delay before try `attempt` (none before the first)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1u64 << attempt) * self.scale_factor_ms)
        }
    }

    /// Run `op` until it succeeds or the policy gives up. `cancelled` is
    /// polled between attempts so a cancelled transfer stops retrying.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancelled: impl Fn() -> bool,
        op: F,
    ) -> ClientResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if cancelled() || !self.should_retry(&e, attempt) {
                        return Err(e);
                    }
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::new(3, 25);
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
    }

    #[test]
    fn test_should_retry_budget_and_class() {
        let policy = RetryPolicy::new(3, 25);
        let transient = ClientError::Timeout("t".to_string());
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));

        let auth = ClientError::Auth("denied".to_string());
        assert!(!policy.should_retry(&auth, 0));
        let throttled = ClientError::Http {
            code: 429,
            message: "slow down".to_string(),
        };
        assert!(policy.should_retry(&throttled, 1));
        let bad_request = ClientError::Http {
            code: 400,
            message: "bad".to_string(),
        };
        assert!(!policy.should_retry(&bad_request, 1));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::new(3, 1);
        let calls = AtomicU32::new(0);
        let out = policy
            .run("test", || false, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClientError::Timeout("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_budget() {
        let policy = RetryPolicy::new(3, 1);
        let calls = AtomicU32::new(0);
        let out: ClientResult<u32> = policy
            .run("test", || false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::Timeout("down".to_string())) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
