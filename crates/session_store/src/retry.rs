//! Bounded retries with exponential backoff and jitter for backend calls.

use crate::backend::BackendError;
use crate::error::SessionError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often, and how patiently, a backend call is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// A backend error after the retry policy stopped trying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub error: BackendError,
    pub attempts: u32,
}

impl BackendFailure {
    /// Maps the failure onto the caller-facing error for `key`.
    pub fn into_session_error(self, key: &str) -> SessionError {
        let key = key.to_string();
        match self.error {
            BackendError::Unavailable(message) => SessionError::BackendUnavailable {
                key,
                attempts: self.attempts,
                message,
            },
            BackendError::AlreadyLocked => SessionError::AlreadyLocked { key },
            BackendError::LockNotHeld => SessionError::LockLost { key },
            BackendError::Corrupt(message) => SessionError::CorruptData { key, message },
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (1 is the first retry): `base_delay`
    /// doubled for each earlier retry and capped at `max_delay`, then stretched
    /// by a random factor in `[1.0, 1.1)` so retrying callers drift apart.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let doublings = (retry - 1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);
        delay.mul_f64(rand::thread_rng().gen_range(1.0..1.1))
    }

    /// Runs `call` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        key: &str,
        mut call: F,
    ) -> Result<T, BackendFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "Backend {} for {} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, key, attempt, max_attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(BackendFailure {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
        };
        let within = |retry: u32, floor_ms: u64| {
            let delay = policy.backoff(retry).as_secs_f64() * 1000.0;
            let floor = floor_ms as f64;
            assert!(
                delay > floor - 0.01 && delay < floor * 1.1 + 0.01,
                "retry {} waited {}ms",
                retry,
                delay
            );
        };

        assert_eq!(policy.backoff(0), Duration::ZERO);
        within(1, 50);
        within(2, 100);
        within(3, 200);
        within(4, 300);
        within(40, 300);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("load", "p1", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run("save", "p1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Unavailable("down".into()))
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(
            failure.into_session_error("p1"),
            SessionError::BackendUnavailable {
                key: "p1".into(),
                attempts: 3,
                message: "down".into(),
            }
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run("try_lock", "p1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::AlreadyLocked)
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
