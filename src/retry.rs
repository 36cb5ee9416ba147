use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Configuration for bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (the first try counts as one).
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Factor to multiply the delay by after each attempt.
    pub backoff_factor: f64,
    /// Wall-clock budget for the whole loop; once exceeded no further
    /// attempts are made even if `max_attempts` has not been reached.
    pub overall_cap: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            overall_cap: None,
        }
    }
}

/// Determines whether an error is worth another attempt.
pub trait RetryPolicy<E> {
    fn is_retryable(&self, error: &E) -> bool;
}

/// Policy that retries every error until the attempt or time budget runs out.
pub struct AlwaysRetry;

impl<E> RetryPolicy<E> for AlwaysRetry {
    fn is_retryable(&self, _error: &E) -> bool {
        true
    }
}

/// Outcome of a retry loop, carrying how many attempts were actually made.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Execute an async operation with bounded retries.
///
/// The operation runs at least once. The last error is returned when the
/// attempt budget, the time budget, or the policy stops the loop.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    policy: impl RetryPolicy<E>,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(attempts, "operation succeeded after retries");
                }
                return RetryOutcome {
                    result: Ok(result),
                    attempts,
                };
            }
            Err(error) => {
                let out_of_attempts = attempts >= config.max_attempts;
                let out_of_time = config
                    .overall_cap
                    .map(|cap| started.elapsed() + delay >= cap)
                    .unwrap_or(false);

                if out_of_attempts || out_of_time || !policy.is_retryable(&error) {
                    warn!(attempts, %error, "operation failed, giving up");
                    return RetryOutcome {
                        result: Err(error),
                        attempts,
                    };
                }

                debug!(attempts, %error, delay_ms = delay.as_millis() as u64, "attempt failed, backing off");
                sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_factor)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
            overall_cap: None,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let outcome = with_retry(&fast_config(3), AlwaysRetry, || async {
            Ok::<_, String>(42)
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retries_until_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(&fast_config(4), AlwaysRetry, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("still pending".to_string()) }
        })
        .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn recovers_midway() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(&fast_config(5), AlwaysRetry, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn overall_cap_stops_the_loop() {
        let config = RetryConfig {
            max_attempts: 1000,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            backoff_factor: 1.0,
            overall_cap: Some(Duration::from_millis(50)),
        };
        let outcome = with_retry(&config, AlwaysRetry, || async {
            Err::<(), _>("pending".to_string())
        })
        .await;
        assert!(outcome.result.is_err());
        assert!(outcome.attempts < 1000);
    }
}
