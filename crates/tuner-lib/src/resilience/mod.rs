//! Resilience primitives for external calls
//!
//! Every call to the metrics backend or the cluster API goes through a
//! [`CallGuard`], which composes:
//! - a [`CircuitBreaker`] that skips calls while the dependency is down
//! - a [`RateLimiter`] that applies client-side backpressure
//! - a [`RetryPolicy`] with capped exponential backoff
//!
//! One guard is built per external-call category and shared by every
//! component that performs that kind of call.

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error returned by a guarded call
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker was open; the operation was not invoked
    #[error("circuit '{0}' is open, call skipped")]
    CircuitOpen(String),
    /// The operation failed on its final attempt
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::CircuitOpen(_))
    }
}

/// Per-category guard settings
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before a trial call
    #[serde(default = "default_circuit_timeout_secs")]
    pub circuit_timeout_secs: u64,
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout_secs() -> u64 {
    60
}

fn default_max_calls() -> usize {
    10
}

fn default_time_window_secs() -> u64 {
    1
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            circuit_timeout_secs: default_circuit_timeout_secs(),
            max_calls: default_max_calls(),
            time_window_secs: default_time_window_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Guard settings for each external-call category
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub metrics_backend: GuardConfig,
    #[serde(default)]
    pub cluster_api: GuardConfig,
    #[serde(default)]
    pub forecaster: GuardConfig,
}

/// Circuit breaker + rate limiter + retry for one category of external call
#[derive(Debug)]
pub struct CallGuard {
    name: String,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl CallGuard {
    pub fn new(name: impl Into<String>, config: &GuardConfig) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(
                name.clone(),
                config.failure_threshold,
                Duration::from_secs(config.circuit_timeout_secs),
            ),
            limiter: RateLimiter::new(
                name.clone(),
                config.max_calls,
                Duration::from_secs(config.time_window_secs),
            ),
            retry: config.retry.clone(),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run a read-style call: breaker check, then rate-limited attempts with
    /// retry. The breaker sees one outcome per guarded call.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.guarded(&self.retry, op).await
    }

    /// Run a mutating call with a single attempt
    ///
    /// Failed patches are left for the next control tick instead of being
    /// retried in a tight loop against the API server.
    pub async fn mutate<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.guarded(&RetryPolicy::none(), op).await
    }

    async fn guarded<T, E, F, Fut>(&self, policy: &RetryPolicy, mut op: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !self.breaker.try_acquire() {
            debug!(guard = %self.name, "Skipping call, circuit open");
            return Err(CallError::CircuitOpen(self.name.clone()));
        }

        let limiter = &self.limiter;
        let result = policy
            .run(&self.name, || {
                let attempt = op();
                async move {
                    limiter.acquire().await;
                    attempt.await
                }
            })
            .await;

        match result {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(CallError::Failed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(threshold: u32) -> GuardConfig {
        GuardConfig {
            failure_threshold: threshold,
            circuit_timeout_secs: 30,
            max_calls: 100,
            time_window_secs: 1,
            retry: RetryPolicy {
                max_retries: 1,
                initial_backoff_ms: 10,
                max_backoff_ms: 10,
                multiplier: 2.0,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_opens_and_skips_wrapped_call() {
        let guard = CallGuard::new("backend", &fast_config(2));
        let counter = AtomicU32::new(0);
        let invocations = &counter;

        for _ in 0..2 {
            let result: Result<(), CallError<String>> = guard
                .call(move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                })
                .await;
            assert!(matches!(result, Err(CallError::Failed(_))));
        }

        assert_eq!(guard.breaker().state(), CircuitState::Open);
        let before = invocations.load(Ordering::SeqCst);

        let result: Result<(), CallError<String>> = guard
            .call(move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.as_ref().is_err_and(|e| e.is_circuit_open()));
        assert_eq!(invocations.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_recovers_after_timeout() {
        let guard = CallGuard::new("cluster", &fast_config(1));

        let _: Result<(), CallError<String>> =
            guard.mutate(|| async { Err("boom".to_string()) }).await;
        assert_eq!(guard.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        let result: Result<u32, CallError<String>> = guard.call(|| async { Ok(7) }).await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_makes_single_attempt() {
        let guard = CallGuard::new("cluster", &fast_config(5));
        let counter = AtomicU32::new(0);
        let invocations = &counter;

        let _: Result<(), CallError<String>> = guard
            .mutate(move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err("conflict".to_string())
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(guard.breaker().failure_count(), 1);
    }
}
