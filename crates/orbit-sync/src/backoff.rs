//! Retry backoff with jitter.

use orbit_core::{OrbitError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff schedule with jitter and a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a schedule starting at `base` and capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay for the next attempt: `base * 2^attempt`, capped, with up to
    /// 50% random jitter so synchronized retries do not stampede.
    pub fn next_delay(&mut self) -> Duration {
        let exponential = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=exponential.as_millis().max(1) / 2);
        exponential + Duration::from_millis(jitter as u64)
    }

    /// Attempts scheduled so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Run `operation` up to `max_attempts` times, sleeping the backoff delay
/// after each retryable failure. Non-retryable errors propagate
/// immediately.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    mut backoff: Backoff,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = OrbitError::invalid("retry with zero attempts");
    for attempt in 0..max_attempts.max(1) {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() => {
                let delay = backoff.next_delay();
                debug!(attempt, ?delay, %error, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                last_error = error;
            }
            Err(error) => return Err(error),
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(second >= Duration::from_millis(200));
        // Capped at 300ms plus at most 50% jitter.
        assert!(third <= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, fast(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(OrbitError::network("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn integrity_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(5, fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OrbitError::signature_invalid("bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let result: Result<()> = with_retry(2, fast(), || async {
            Err(OrbitError::network("still down"))
        })
        .await;
        assert!(matches!(result.unwrap_err(), OrbitError::Network { .. }));
    }
}
