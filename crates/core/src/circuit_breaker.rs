use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{RelayError, RelayResult};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// Trial calls decide between Closed and Open
    HalfOpen,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while Closed) that open the circuit
    pub failure_threshold: u32,
    /// Time spent Open before a trial call is admitted
    pub recovery_timeout: Duration,
    /// Successful trial calls needed to close again
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_successes: 3,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    /// Seconds since the last recorded failure
    pub last_failure_secs_ago: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_success_count: u32,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_success_count: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }
}

/// 依赖熔断器
///
/// One instance per external dependency. Every check and every mutation runs
/// under a single async mutex, so concurrent callers on a multi-threaded runtime
/// observe a consistent state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may proceed right now.
    ///
    /// An Open breaker whose recovery timeout has elapsed moves to HalfOpen here
    /// and admits the call.
    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_success_count = 0;
                    info!(breaker = %self.name, "熔断器进入半开状态");
                    true
                } else {
                    inner.rejected_calls += 1;
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_success_count += 1;
                if inner.half_open_success_count >= self.config.half_open_successes {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_success_count = 0;
                    info!(breaker = %self.name, "熔断器已恢复关闭");
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            // A call admitted before the breaker opened finished late.
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_success_count = 0;
                warn!(breaker = %self.name, "半开试探失败，熔断器重新打开");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "连续失败达到阈值，熔断器打开"
                );
            }
            _ => {}
        }
    }

    /// Runs `operation` under the breaker: denied calls fail with `CircuitOpen`
    /// without invoking it, and the outcome is recorded unless the error kind is
    /// exempt from breaker accounting.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RelayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RelayResult<T>>,
    {
        if !self.can_execute().await {
            return Err(RelayError::CircuitOpen {
                dependency: self.name.clone(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if err.counts_against_breaker() {
                    self.record_failure().await;
                }
                Err(err)
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_success_count: inner.half_open_success_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            last_failure_secs_ago: inner.last_failure_time.map(|at| at.elapsed().as_secs()),
        }
    }

    pub async fn reset(&self) {
        *self.inner.lock().await = BreakerInner::new();
    }
}

/// Named breakers, one per external dependency, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs<I, S>(configs: I) -> Self
    where
        I: IntoIterator<Item = (S, CircuitBreakerConfig)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (name, config) in configs {
            registry.register(name, config);
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config));
        self.breakers.insert(name, breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats = Vec::with_capacity(self.breakers.len());
        for breaker in self.breakers.values() {
            stats.push(breaker.stats().await);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, recovery_ms: u64, half_open_successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "ocr",
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
                half_open_successes,
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 60_000, 3);

        for _ in 0..2 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.can_execute().await);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.can_execute().await);
        assert_eq!(cb.stats().await.rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_while_closed() {
        let cb = breaker(3, 60_000, 3);

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.stats().await.failure_count, 2);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let cb = breaker(1, 100, 2);

        cb.record_failure().await;
        assert!(!cb.can_execute().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cb.can_execute().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.stats().await.failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 100, 3);

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cb.can_execute().await);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.can_execute().await);
    }

    #[tokio::test]
    async fn test_execute_rejects_without_invoking() {
        let cb = breaker(1, 60_000, 1);
        cb.record_failure().await;

        let mut invoked = false;
        let result: RelayResult<()> = cb
            .execute(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(!invoked);
        assert!(matches!(result, Err(RelayError::CircuitOpen { ref dependency }) if dependency == "ocr"));
    }

    #[tokio::test]
    async fn test_execute_ignores_validation_failures() {
        let cb = breaker(1, 60_000, 1);

        let result: RelayResult<()> = cb
            .execute(|| async { Err(RelayError::Validation("imageBase64 is required".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.stats().await.total_failures, 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_exactly_once() {
        let cb = Arc::new(breaker(5, 60_000, 3));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { cb.record_failure().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = cb.stats().await;
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.total_failures, 20);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = breaker(1, 60_000, 1);
        cb.record_failure().await;
        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.can_execute().await);
    }

    #[tokio::test]
    async fn test_registry_lookup_and_snapshot() {
        let registry = CircuitBreakerRegistry::from_configs([
            ("gemini", CircuitBreakerConfig::default()),
            ("ocr", CircuitBreakerConfig::default()),
        ]);

        assert_eq!(registry.names(), vec!["gemini".to_string(), "ocr".to_string()]);
        assert!(registry.get("supabase").is_none());

        let gemini = registry.get("gemini").unwrap();
        gemini.record_failure().await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "gemini");
        assert_eq!(snapshot[0].failure_count, 1);
        assert_eq!(snapshot[1].failure_count, 0);
    }
}
