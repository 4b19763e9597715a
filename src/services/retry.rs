//! Explicit retry policy.
//!
//! Wraps rebuild-lock acquisition (and anything else that fails
//! transiently) in a bounded loop with exponential backoff. Attempts sleep
//! between tries; nothing here busy-waits.

use crate::config::{MAX_LOCK_BACKOFF, RepostConfig};
use crate::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: MAX_LOCK_BACKOFF,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    /// Policy for rebuild lock acquisition from configuration.
    #[must_use]
    pub fn from_config(config: &RepostConfig) -> Self {
        Self::new(config.lock_retry_attempts, config.lock_retry_backoff)
    }

    /// A policy that tries once.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Sets the maximum single delay.
    #[must_use]
    pub const fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX).min(64);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Runs `op` until it succeeds, fails with an error `is_retryable`
    /// rejects, or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last error once
    /// attempts are exhausted.
    pub fn run<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut(u32) -> Result<T>,
        is_retryable: impl Fn(&Error) -> bool,
    ) -> Result<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.backoff_for(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying after transient failure"
                    );
                    metrics::counter!("repostscan_retries_total", "operation" => operation)
                        .increment(1);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0; "no attempt yet")]
    #[test_case(1, 100; "first")]
    #[test_case(2, 200; "second")]
    #[test_case(4, 800; "fourth")]
    #[test_case(10, 1_000; "capped")]
    fn test_backoff_schedule(attempt: u32, expected_ms: u64) {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_backoff(Duration::from_secs(1));
        assert_eq!(policy.backoff_for(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_backoff_survives_huge_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(u32::MAX), MAX_LOCK_BACKOFF);
    }

    #[test]
    fn test_run_retries_until_success() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let result = policy.run(
            "test",
            |attempt| {
                if attempt < 3 {
                    Err(Error::LockUnavailable {
                        name: "image".to_string(),
                    })
                } else {
                    Ok(attempt)
                }
            },
            Error::is_retryable,
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_run_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<()> = policy.run(
            "test",
            |attempt| {
                calls += 1;
                Err(Error::NoIndexAvailable(format!("attempt {attempt}")))
            },
            Error::is_retryable,
        );
        assert_eq!(calls, 3);
        assert_eq!(
            result.unwrap_err().to_string(),
            "no index available: attempt 3"
        );
    }

    #[test]
    fn test_run_stops_on_permanent_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<()> = policy.run(
            "test",
            |_| {
                calls += 1;
                Err(Error::InvalidInput("bad".to_string()))
            },
            Error::is_retryable,
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::no_retry()
        };
        assert_eq!(policy.run("test", |_| Ok(7), |_| true).unwrap(), 7);
    }
}
