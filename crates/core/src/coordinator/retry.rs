//! Retry loop for transient store failures.

use std::future::Future;
use std::time::Duration;

use crate::Error;

/// Largest doubling applied to the base delay.
const MAX_SHIFT: u32 = 16;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backoff {
    /// `base * 2^(retry - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// `step * retry`.
    Linear { step: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (starting at 1).
    pub(crate) fn delay(self, retry: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let shift = retry.saturating_sub(1).min(MAX_SHIFT);
                base.saturating_mul(1 << shift).min(max)
            }
            Backoff::Linear { step } => step.saturating_mul(retry.max(1)),
        }
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// has been retried `max_retries` times.
///
/// `op` receives the attempt number, starting at 1. A retryable failure on
/// the last attempt is wrapped in [`Error::RetriesExhausted`].
pub(crate) async fn with_retries<T, F, Fut>(
    what: &'static str, max_retries: u32, backoff: Backoff, retryable: fn(&Error) -> bool, mut op: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if retryable(&e) => {
                if attempt > max_retries {
                    tracing::warn!(what, attempts = attempt, error = %e, "giving up");
                    return Err(Error::RetriesExhausted { attempts: attempt, source: Box::new(e) });
                }
                let delay = backoff.delay(attempt);
                tracing::debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn busy() -> Error {
        Error::StoreBusy("database is locked".into())
    }

    const EXP: Backoff = Backoff::Exponential { base: Duration::from_millis(100), max: Duration::from_millis(1_000) };

    #[test]
    fn test_exponential_is_capped() {
        let delays: Vec<u64> = (1..=6).map(|r| EXP.delay(r).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(EXP.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_grows_by_step() {
        let linear = Backoff::Linear { step: Duration::from_millis(25) };
        assert_eq!(linear.delay(1), Duration::from_millis(25));
        assert_eq!(linear.delay(3), Duration::from_millis(75));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let value = with_retries("test", 3, EXP, Error::is_busy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 3 { Err(busy()) } else { Ok(attempt) } }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let result: Result<(), Error> = with_retries("test", 2, EXP, Error::is_busy, |_| async { Err(busy()) }).await;
        match result {
            Err(Error::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_busy());
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retries("test", 5, EXP, Error::is_busy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::InvalidInput("constraint".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
