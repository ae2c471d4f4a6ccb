// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for transient remote failures.
//!
//! The caller decides what is transient; everything else is returned on the
//! first failure.
//!
//! ```
//! use record_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let backoff = RetryConfig::remote();
//! assert_eq!(backoff.max_retries, Some(3));
//! assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
//! assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff schedule.
///
/// `max_retries` counts retries, not attempts: `Some(3)` means one initial
/// attempt plus up to three more. `None` retries until the caller's timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::remote()
    }
}

impl RetryConfig {
    /// 2s, 4s, 8s, then give up.
    #[must_use]
    pub fn remote() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
            max_retries: Some(3),
        }
    }

    /// Fail on the first error.
    #[must_use]
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            max_retries: Some(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            ..Self::remote()
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    fn exhausted(&self, retries: usize) -> bool {
        self.max_retries.is_some_and(|max| retries >= max)
    }
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or the retry budget is spent. The last error is returned.
pub async fn retry<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(operation = operation_name, retries, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_transient(&err) || config.exhausted(retries) {
            return Err(err);
        }

        retries += 1;
        let delay = config.delay_for_attempt(retries);
        warn!(
            operation = operation_name,
            retry = retries,
            max_retries = ?config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );
        crate::metrics::record_retry(operation_name);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        msg: String,
        transient: bool,
    }

    impl TestError {
        fn transient(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: true }
        }

        fn fatal(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: false }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.msg)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::fast(),
            |e: &TestError| e.transient,
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::fast(),
            |e: &TestError| e.transient,
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError::transient(&format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::fast(),
            |e: &TestError| e.transient,
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::transient("always fail"))
                }
            },
        ).await;

        assert!(result.unwrap_err().msg.contains("always fail"));
        // initial attempt + 3 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::fast(),
            |e: &TestError| e.transient,
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::fatal("unauthorized"))
                }
            },
        ).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_backoff_waits_two_four_eight() {
        let start = tokio::time::Instant::now();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::remote(),
            |e: &TestError| e.transient,
            || async { Err(TestError::transient("429")) },
        ).await;

        assert!(result.is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2 + 4 + 8));
        assert!(elapsed < Duration::from_secs(15));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_retries: Some(5),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_retry_preset_makes_one_attempt() {
        let attempts = AtomicUsize::new(0);

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::none(),
            |e: &TestError| e.transient,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::transient("429")) }
            },
        ).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retries_until_success() {
        let attempts = AtomicUsize::new(0);
        let config = RetryConfig {
            max_retries: None,
            ..RetryConfig::remote()
        };

        let result: Result<usize, TestError> = retry(
            "test_op",
            &config,
            |e: &TestError| e.transient,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 10 {
                        Err(TestError::transient("connection reset"))
                    } else {
                        Ok(n)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 10);
    }
}
