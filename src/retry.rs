// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Bounded exponential backoff used when (re)connecting to the broker.

use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// Runs an operation once, then retries it up to `retries` more times,
/// sleeping `base * 2^attempt` before retry number `attempt` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    base: Duration,
}

impl RetryPolicy {
    /// `2^attempt` seconds between attempts.
    pub fn exponential(retries: u32) -> Self {
        RetryPolicy {
            retries,
            base: Duration::from_secs(1),
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Total sleep before the given retry count is exhausted.
    pub fn total_delay(&self, attempts: u32) -> Duration {
        (1..=attempts).map(|attempt| self.delay_for(attempt)).sum()
    }

    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::exponential(5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.total_delay(3), Duration::from_secs(2 + 4 + 8));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures_within_the_limit() {
        for failures in 0..=5u32 {
            let policy = RetryPolicy::exponential(5);
            let counter = AtomicU32::new(0);
            let calls = &counter;
            let started = Instant::now();

            let result = policy
                .run(move || async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    if call < failures {
                        Err("broker unreachable")
                    } else {
                        Ok(call)
                    }
                })
                .await;

            assert_eq!(result, Ok(failures));
            assert_eq!(counter.load(Ordering::SeqCst), failures + 1);

            let elapsed = started.elapsed();
            let expected = policy.total_delay(failures);
            assert!(elapsed >= expected, "{elapsed:?} < {expected:?}");
            assert!(elapsed < expected + Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_once_retries_are_exhausted() {
        let policy = RetryPolicy::exponential(2);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), &str> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("broker unreachable")
            })
            .await;

        assert_eq!(result, Err("broker unreachable"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_tries_once() {
        let policy = RetryPolicy::exponential(0);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), &str> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
