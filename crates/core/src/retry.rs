use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::RelayError;

/// 重试策略
///
/// Bounded exponential backoff. `get_delay` is a pure function of the attempt
/// index apart from the optional jitter factor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 指数退避倍数
    pub multiplier: f64,
    /// Multiply each delay by a uniform factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to sleep after the zero-based `attempt` failed.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay = (base * self.multiplier.powi(exponent)).min(max);

        if self.jitter {
            delay *= rand::rng().random_range(0.5..1.5);
            delay = delay.min(max);
        }

        if delay.is_finite() && delay > 0.0 {
            Duration::from_secs_f64(delay)
        } else {
            Duration::ZERO
        }
    }

    /// Retries every error until `max_attempts` is exhausted.
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.execute_with_retry_if(operation, |_| true).await
    }

    /// Like `execute_with_retry`, but gives up immediately when `should_retry`
    /// rejects the error. The last error is returned unchanged.
    pub async fn execute_with_retry_if<F, Fut, T, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
        P: Fn(&RelayError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "重试后执行成功");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let is_last = attempt + 1 >= max_attempts;
                    if is_last || !should_retry(&err) {
                        return Err(err);
                    }

                    let delay = self.get_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "执行失败，准备重试"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
