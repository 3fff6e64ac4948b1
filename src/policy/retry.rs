//! Retry with backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::KyroResult;

use super::config::{BackoffPolicy, BackoffStrategy, RetryPolicy};

/// Delay in ms before retry number `attempt + 1` (`attempt` counts from 0).
///
/// Always at most `max_delay_ms`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn calculate_delay(attempt: u32, backoff: &BackoffPolicy) -> u64 {
    let raw = match backoff.strategy {
        BackoffStrategy::Constant => backoff.delay_ms,
        BackoffStrategy::Linear => backoff.delay_ms.saturating_mul(u64::from(attempt) + 1),
        BackoffStrategy::Exponential => {
            let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
            let d = backoff.delay_ms as f64 * backoff.factor.powi(exp);
            if d.is_finite() && d < backoff.max_delay_ms as f64 {
                d.max(0.0) as u64
            } else if d.is_nan() {
                backoff.delay_ms
            } else {
                backoff.max_delay_ms
            }
        }
    };
    raw.min(backoff.max_delay_ms)
}

/// Runs `op` up to `retry.max_attempts` times.
///
/// Non-retryable errors (see [`crate::KyroError::is_retryable`]) end the
/// loop at once. When attempts run out the last error is returned as is.
pub async fn with_retry<T, F, Fut>(mut op: F, retry: &RetryPolicy, label: &str) -> KyroResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KyroResult<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = calculate_delay(attempt - 1, &retry.backoff);
                tracing::debug!(label, attempt, max_attempts, delay_ms = delay, error = %e, "retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::{KyroError, ResolverError};

    fn backoff(strategy: BackoffStrategy) -> BackoffPolicy {
        BackoffPolicy {
            strategy,
            delay_ms: 100,
            factor: 2.0,
            max_delay_ms: 1_000,
        }
    }

    #[test]
    fn test_delay_shapes() {
        let exp = backoff(BackoffStrategy::Exponential);
        assert_eq!(calculate_delay(0, &exp), 100);
        assert_eq!(calculate_delay(1, &exp), 200);
        assert_eq!(calculate_delay(3, &exp), 800);
        assert_eq!(calculate_delay(4, &exp), 1_000);

        let lin = backoff(BackoffStrategy::Linear);
        assert_eq!(calculate_delay(0, &lin), 100);
        assert_eq!(calculate_delay(2, &lin), 300);
        assert_eq!(calculate_delay(50, &lin), 1_000);

        let constant = backoff(BackoffStrategy::Constant);
        assert_eq!(calculate_delay(0, &constant), 100);
        assert_eq!(calculate_delay(9, &constant), 100);
    }

    #[test]
    fn test_delay_monotonic_and_clamped() {
        for strategy in [BackoffStrategy::Exponential, BackoffStrategy::Linear, BackoffStrategy::Constant] {
            let b = backoff(strategy);
            let mut prev = 0;
            for n in 0..200 {
                let d = calculate_delay(n, &b);
                assert!(d >= prev, "{strategy:?} decreased at {n}");
                assert!(d <= b.max_delay_ms);
                prev = d;
            }
        }
        let huge = BackoffPolicy {
            factor: 1e300,
            ..backoff(BackoffStrategy::Exponential)
        };
        assert_eq!(calculate_delay(u32::MAX, &huge), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, BackoffPolicy::constant(10));
        let out = with_retry(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ResolverError::Connection(format!("attempt {n}")).into())
                } else {
                    Ok(n)
                }
            },
            &policy,
            "op",
        )
        .await
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_original_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, BackoffPolicy::constant(10));
        let err = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResolverError::Backend("disk on fire".to_string()).into())
            },
            &policy,
            "op",
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err, KyroError::Resolver(ResolverError::Backend("disk on fire".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_backend_runs_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, BackoffPolicy::constant(10));
        let err = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResolverError::Serialization("truncated frame".to_string()).into())
            },
            &policy,
            "op",
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, KyroError::Resolver(ResolverError::Serialization(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResolverError::DuplicateKey("1".to_string()).into())
            },
            &RetryPolicy::default(),
            "op",
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, KyroError::Resolver(ResolverError::DuplicateKey(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(3, backoff(BackoffStrategy::Exponential));
        let _ = with_retry(
            || async { Err::<(), _>(ResolverError::Connection("down".to_string()).into()) },
            &policy,
            "op",
        )
        .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
    }
}
