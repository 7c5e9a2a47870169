use std::future::Future;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::time::sleep;

use crate::config::UpstreamRateSettings;
use crate::error::ArbError;

use super::limiter::AdaptiveRateLimiter;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_settings(rate: &UpstreamRateSettings) -> Self {
        Self {
            max_attempts: rate.max_attempts.max(1),
            backoff_base: Duration::from_millis(rate.backoff_base_ms),
            backoff_max: Duration::from_millis(rate.backoff_max_ms),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.backoff_max);
        let jitter = exp.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
        exp + jitter
    }
}

/// Run `op` under the limiter with bounded retries. Every attempt consumes a
/// token; 429s are reported to the limiter so it adapts. The final failure is
/// returned to the caller untouched.
pub async fn with_retry<T, F, Fut>(
    limiter: &AdaptiveRateLimiter,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, ArbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ArbError>>,
{
    let mut attempt = 0;
    loop {
        match limiter.schedule(op()).await {
            Ok(value) => {
                limiter.note_success();
                return Ok(value);
            }
            Err(err) => {
                if err.is_rate_limit() {
                    limiter.note_429();
                }
                attempt += 1;
                if attempt >= policy.max_attempts || !err.is_retryable() {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    "[{}] attempt {attempt}/{} failed ({err}), retrying in {}ms",
                    limiter.name(),
                    policy.max_attempts,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::limiter::LimiterConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(LimiterConfig {
            name: "test".to_string(),
            base_rps: 10_000.0,
            min_rps: 100.0,
            burst: 10_000.0,
            penalty: Duration::from_millis(1_000),
            recovery_every: Duration::from_millis(1_000),
            recovery_step_rps: 0.1,
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let limiter = fast_limiter();
        let calls = AtomicU32::new(0);
        let result = with_retry(&limiter, &fast_policy(4), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ArbError::HttpStatus { status: 503, body: "busy".into() })
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
    async fn permanent_errors_fail_fast() {
        let limiter = fast_limiter();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&limiter, &fast_policy(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ArbError::HttpStatus { status: 400, body: "bad".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded_and_429_slows_the_bucket() {
        let limiter = fast_limiter();
        let calls = AtomicU32::new(0);
        let before = limiter.current_rps();
        let result: Result<(), _> = with_retry(&limiter, &fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ArbError::RateLimitExceeded("HTTP 429".into())) }
        })
        .await;
        assert!(result.unwrap_err().is_rate_limit());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(limiter.current_rps() < before);
    }
}
