//! Whole-transaction retry on lock contention.
//!
//! A transaction aborted by `SQLITE_BUSY`/`SQLITE_LOCKED`, a serialization
//! failure, or a deadlock has been rolled back completely, so the backend
//! re-runs the whole closure after a randomized delay.

use std::time::Duration;

use rand::Rng;

use crate::error;

/// Bounded exponential backoff with jitter for contended transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    ///
    /// The nominal delay doubles each attempt up to `max_delay`; the actual
    /// delay is drawn uniformly from the upper half of it so concurrent
    /// retriers spread out.
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let nominal_ms = u64::try_from(nominal.as_millis()).unwrap_or(u64::MAX);
        if nominal_ms == 0 {
            return Duration::ZERO;
        }
        let lower = (nominal_ms / 2).max(1);
        Duration::from_millis(rng.random_range(lower..=nominal_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// # Errors
///
/// Returns the last error from `op`.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> error::Result<T>,
) -> error::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, &mut rand::rng());
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transaction contended, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn busy() -> StateError {
        StateError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn retries_busy_until_success() {
        let mut calls = 0;
        let result = with_retry(&fast_policy(5), "test", || {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: error::Result<()> = with_retry(&fast_policy(3), "test", || {
            calls += 1;
            Err(busy())
        });
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_retryable_error_fails_immediately() {
        let mut calls = 0;
        let result: error::Result<()> = with_retry(&fast_policy(5), "test", || {
            calls += 1;
            Err(StateError::LockPoisoned)
        });
        assert!(matches!(result, Err(StateError::LockPoisoned)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..12 {
            let delay = policy.delay_for(attempt, &mut rng);
            assert!(delay <= policy.max_delay, "attempt {attempt}: {delay:?}");
            assert!(delay >= Duration::from_millis(5), "attempt {attempt}: {delay:?}");
        }
        assert!(policy.delay_for(10, &mut rng) >= Duration::from_millis(250));
    }
}
