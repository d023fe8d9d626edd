//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::IngestError;

/// Retries transient failures with exponential backoff.
///
/// A rate-limit error carrying a server-provided delay waits exactly that
/// long without consuming an attempt; everything non-transient propagates
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Backoff for the given zero-based attempt: `base * 2^attempt`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op`, retrying per the policy. Surfaces the last error once
    /// `max_retries` transient attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(IngestError::RateLimited {
                    retry_after: Some(delay),
                }) => {
                    // Server told us exactly when to come back; this does
                    // not count against the retry budget.
                    warn!(delay_secs = delay.as_secs(), "rate limited, honoring Retry-After");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if retryable(&err) => {
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Transient errors and unhinted rate limits consume retry attempts.
fn retryable(err: &IngestError) -> bool {
    matches!(
        err,
        IngestError::Transient(_) | IngestError::RateLimited { retry_after: None }
    )
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = policy()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(IngestError::Transient("boom".into()))
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_retries_plus_one_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(IngestError::Transient("always".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(IngestError::Permanent("bad request".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_does_not_consume_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = policy()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    // Five hinted rate limits, more than max_retries, then
                    // a transient failure, then success.
                    if n < 5 {
                        Err(IngestError::RateLimited {
                            retry_after: Some(Duration::from_secs(2)),
                        })
                    } else if n == 5 {
                        Err(IngestError::Transient("blip".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_backoff_delays_non_decreasing_and_capped() {
        let p = policy();
        let mut prev = Duration::ZERO;
        for attempt in 0..10 {
            let d = p.backoff_delay(attempt);
            assert!(d >= prev);
            assert!(d <= Duration::from_secs(30));
            prev = d;
        }
        assert_eq!(p.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(8));
    }
}
