//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use gitdock_core::{RepoError, RepoResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How often and how long to wait before retrying a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the next attempt after `attempt` failed with `err`, or
    /// `None` when the error should be surfaced.
    pub fn delay_for(&self, attempt: u32, err: &RepoError) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.max_attempts {
            return None;
        }

        if let RepoError::RateLimited { retry_after } = err {
            return (*retry_after <= self.max_delay).then_some(*retry_after);
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exponent);
        Some(delay.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Waiting between attempts ends early with `Cancelled` when `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> RepoResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RepoResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(delay) = self.delay_for(attempt, &err) else {
                return Err(err);
            };
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RepoError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let err = RepoError::network("down");
        let policy = policy();
        assert_eq!(policy.delay_for(1, &err), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2, &err), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3, &err), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(4, &err), None);
    }

    #[test]
    fn test_structural_errors_are_not_retried() {
        assert_eq!(policy().delay_for(1, &RepoError::NothingToCommit), None);
        assert_eq!(
            policy().delay_for(
                1,
                &RepoError::AuthRejected {
                    message: "nope".into()
                }
            ),
            None
        );
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let short = RepoError::RateLimited {
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(policy().delay_for(1, &short), Some(Duration::from_millis(200)));

        let long = RepoError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(policy().delay_for(1, &long), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = policy()
            .run(&CancellationToken::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RepoError::network("flaky"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: RepoResult<()> = policy()
            .run(&CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepoError::network("down"))
            })
            .await;

        assert!(matches!(result, Err(RepoError::NetworkUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: RepoResult<()> = policy()
            .run(&cancel, || async { Err(RepoError::network("down")) })
            .await;
        assert_eq!(result, Err(RepoError::Cancelled));
    }
}
