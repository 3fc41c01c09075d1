//! Exponential backoff with jitter, and a retry wrapper for fallible async
//! operations that must stop early on cancellation.

use std::fmt::{Debug, Display};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_BACKOFF_MILLIS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MILLIS: u64 = 30_000;
/// Fraction of the computed delay added or subtracted at random, to keep
/// simultaneous retries from synchronizing against the same endpoint.
pub const JITTER_FRACTION: f64 = 0.2;

/// Delay before attempt `n` (the first attempt is `n == 0` and gets no delay).
pub fn exponential_backoff_duration(n: u32, base_millis: u64, max_millis: u64) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let exp = base_millis.saturating_mul(1_u64 << (n - 1).min(32));
    let capped = exp.min(max_millis) as f64;
    let jitter = capped * JITTER_FRACTION;
    let millis = rand::thread_rng().gen_range((capped - jitter)..=(capped + jitter));
    Duration::from_millis(millis as u64)
}

pub async fn exponential_backoff(
    n: u32,
    base_millis: u64,
    max_millis: u64,
    cancel: &CancellationToken,
) {
    let delay = exponential_backoff_duration(n, base_millis, max_millis);
    if delay.is_zero() {
        return;
    }
    tracing::info!("Backoff: waiting {delay:?} before the next attempt");
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {}
    }
}

/// Retries `op` until it succeeds, returns a permanent error, or
/// `max_attempts` is exhausted. Returns `None` iff cancelled.
///
/// Attempts past `warn_threshold` are logged at warning level, earlier
/// failures at info, so that a single transient hiccup does not page anyone.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_attempts: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    O: FnMut() -> F,
    F: std::future::Future<Output = Result<T, E>>,
    E: Display + Debug + 'static,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let result = op().await;
        match &result {
            Ok(_) => {
                if attempt > 0 {
                    tracing::info!("{description} succeeded after {attempt} retries");
                }
                return Some(result);
            }
            Err(e) if is_permanent(e) => {
                return Some(result);
            }
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    tracing::error!("{description} still failed after {max_attempts} attempts: {e:#}");
                    return Some(result);
                }
                if attempt >= warn_threshold {
                    tracing::warn!("{description} failed, will retry (attempt {attempt}): {e:#}");
                } else {
                    tracing::info!("{description} failed, will retry (attempt {attempt}): {e:#}");
                }
            }
        }
        attempt += 1;
        exponential_backoff(
            attempt,
            DEFAULT_BASE_BACKOFF_MILLIS,
            DEFAULT_MAX_BACKOFF_MILLIS,
            cancel,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..32 {
            let d1 = exponential_backoff_duration(1, 500, 30_000);
            let d4 = exponential_backoff_duration(4, 500, 30_000);
            let dmax = exponential_backoff_duration(20, 500, 30_000);
            assert!(d1 >= Duration::from_millis(400) && d1 <= Duration::from_millis(600));
            assert!(d4 >= Duration::from_millis(3200) && d4 <= Duration::from_millis(4800));
            assert!(dmax <= Duration::from_millis(36_000));
        }
        assert_eq!(exponential_backoff_duration(0, 500, 30_000), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<(), &str>> = retry(
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err("permission denied") }
            },
            |_| true,
            3,
            5,
            "test op",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Err(_))));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_attempts() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<(), &str>> = retry(
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err("connection reset") }
            },
            |_| false,
            3,
            5,
            "test op",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Err(_))));
        assert_eq!(attempts.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn retry_returns_none_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<Result<(), &str>> =
            retry(|| async { Err("nope") }, |_| false, 3, 5, "test op", &cancel).await;
        assert!(result.is_none());
    }
}
