//! Bounded retry for provider calls and error classification.

use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry policy. No jitter, no backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// One retry, immediately. Used for structured-output calls.
    pub fn once() -> Self {
        Self::new(2, Duration::ZERO)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Returns the last error when every attempt fails.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.max_attempts => {
                tracing::warn!(
                    %error,
                    attempt,
                    max_attempts = policy.max_attempts,
                    operation = label,
                    "attempt failed, retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Whether an HTTP status code indicates a rate limit or exhausted quota.
pub fn is_rate_limit_status(status: u16) -> bool {
    matches!(status, 402 | 429)
}

/// Whether an error message indicates a rate limit or exhausted quota.
pub fn is_rate_limit_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
        || lower.contains("quota")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn stops_after_first_success() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = retry(RetryPolicy::new(5, Duration::ZERO), "test", || {
            calls.set(calls.get() + 1);
            let attempt = calls.get();
            async move {
                if attempt < 3 {
                    Err(format!("failure {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry(RetryPolicy::once(), "test", || {
            calls.set(calls.get() + 1);
            let attempt = calls.get();
            async move { Err(format!("failure {attempt}")) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn rate_limits_are_recognized() {
        assert!(is_rate_limit_error("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_error("Daily quota exceeded"));
        assert!(!is_rate_limit_error("connection reset"));
        assert!(is_rate_limit_status(429));
        assert!(!is_rate_limit_status(500));
    }
}
