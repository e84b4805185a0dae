//! Per-call timeout and retry with exponential backoff.
//!
//! Every embedding, index and validator call goes through
//! [`RetryPolicy::run`]:
//!
//! - each attempt is bounded by `call_timeout` (an elapsed timeout becomes
//!   [`MapError::Timeout`]),
//! - retryable failures ([`MapError::is_retryable`]) are retried up to
//!   `max_retries` times, sleeping `base_delay × 2^(n-1)` capped at
//!   `max_delay`, plus random jitter of up to half that delay,
//! - anything else is returned on the first occurrence.
//!
//! The attempt count is reported with the value so callers can tell a
//! clean success from one that needed retries.

use std::future::Future;
use std::time::Duration;

use rand_core::{OsRng, RngCore};
use tracing::{debug, warn};

use crate::error::{MapError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// A value together with the number of attempts it took (1 = first try).
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    pub fn recovered(&self) -> bool {
        self.attempts > 1
    }
}

impl RetryPolicy {
    /// No retries and no delay. Useful in tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let half = delay.as_millis() as u64 / 2;
        if half == 0 {
            return delay;
        }
        delay + Duration::from_millis(OsRng.next_u64() % (half + 1))
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    ///
    /// On exhaustion the last retryable error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<Attempted<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(MapError::Timeout {
                    operation: operation.to_string(),
                }),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "recovered after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.jittered(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(operation, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounded_by_half_delay() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = p.jittered(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = fast()
            .run("validate", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(MapError::ValidatorUnavailable("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out.value, 3);
        assert_eq!(out.attempts, 3);
        assert!(out.recovered());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("embed", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MapError::EmbeddingUnavailable("429".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::EmbeddingUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("validate", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MapError::InvalidRequest("bad body".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::InvalidRequest(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy {
            max_retries: 1,
            call_timeout: Duration::from_millis(10),
            ..fast()
        };
        let err = policy
            .run("search", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, MapError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::Timeout { operation } if operation == "search"));
    }
}
