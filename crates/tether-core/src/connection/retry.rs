//! Capped exponential backoff for transient spawn/probe failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Delay before retry number `attempt` (zero-based).
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = Duration::from_millis(cfg.base_delay_ms).as_secs_f64();
    let max = Duration::from_millis(cfg.max_delay_ms).as_secs_f64();
    let exponential = base * cfg.backoff_factor.powi(attempt as i32);
    let capped = exponential.min(max);

    let delay = if cfg.jitter {
        capped * rand::rng().random_range(0.5..1.5)
    } else {
        capped
    };
    Duration::from_secs_f64(delay.max(0.0))
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `cfg.max_attempts` attempts have been made.
pub async fn with_backoff<F, Fut, T, E>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() {
                    warn!(what, attempt, error = %err, "non-retryable error");
                    return Err(err);
                }
                if attempt >= cfg.max_attempts.max(1) {
                    warn!(what, attempt, error = %err, "retry attempts exhausted");
                    return Err(err);
                }
                let delay = backoff_delay(cfg, attempt - 1);
                warn!(
                    what,
                    attempt,
                    max_attempts = cfg.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Flaky {
        retryable: bool,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (retryable: {})", self.retryable)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    async fn count_attempts(cfg: &RetryConfig, succeed_on: u32, retryable: bool) -> (u32, bool) {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), Flaky> = with_backoff(cfg, "test", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= succeed_on {
                    Ok(())
                } else {
                    Err(Flaky { retryable })
                }
            }
        })
        .await;
        (calls.load(Ordering::SeqCst), result.is_ok())
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        assert_eq!(count_attempts(&fast(), u32::MAX, false).await, (1, false));
    }

    #[tokio::test]
    async fn retryable_error_stops_at_max_attempts() {
        assert_eq!(count_attempts(&fast(), u32::MAX, true).await, (3, false));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        assert_eq!(count_attempts(&fast(), 2, true).await, (2, true));
    }

    #[test]
    fn delay_grows_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 300,
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(300));
        assert_eq!(backoff_delay(&cfg, 6), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let cfg = RetryConfig {
            jitter: true,
            ..fast()
        };
        for _ in 0..50 {
            let d = backoff_delay(&cfg, 0);
            assert!(d >= Duration::from_micros(500) && d <= Duration::from_micros(1500));
        }
    }
}
