//! Per-service circuit breakers.
//!
//! Three-state FSM: closed → open after `max_failures` consecutive failures,
//! open → half-open once `reset_timeout` has elapsed at the next call
//! attempt, half-open → closed after `success_threshold` consecutive
//! successes, half-open → open on any failure.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use specgate_core::{GatewayError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Circuit breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// How long an open circuit waits before probing the upstream again.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Wall-clock deadline for each protected call.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Counter snapshot exposed by [`CircuitBreaker::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_timeouts: u64,
    pub total_rejected: u64,
    /// Seconds since the most recent failure, when one has occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_age_secs: Option<f64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_timeouts: u64,
    total_rejected: u64,
}

/// One circuit breaker, created lazily per service and alive for the process
/// lifetime.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure_at: None,
                next_attempt_at: None,
                total_requests: 0,
                total_failures: 0,
                total_successes: 0,
                total_timeouts: 0,
                total_rejected: 0,
            }),
        }
    }

    /// Run a protected call.
    ///
    /// # Errors
    ///
    /// *circuit-open* when the breaker rejects without invoking the upstream,
    /// *timeout* when the call outlives the configured deadline, *cancelled*
    /// on cancellation, or whatever the call itself fails with.
    pub async fn call<T, F>(&self, cancel: &CancellationToken, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.call_with_fallback(cancel, call, None::<fn(&GatewayError) -> Result<T>>).await
    }

    /// Run a protected call with a fallback that may convert *circuit-open*
    /// and *timeout* failures into clean responses.
    pub async fn call_with_fallback<T, F, FB>(
        &self,
        cancel: &CancellationToken,
        call: F,
        fallback: Option<FB>,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        FB: FnOnce(&GatewayError) -> Result<T>,
    {
        if let Some(rejection) = self.admit() {
            return match fallback {
                Some(fallback) => fallback(&rejection),
                None => Err(rejection),
            };
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.on_result(false);
                Err(GatewayError::Cancelled)
            }
            outcome = tokio::time::timeout(self.config.timeout, call) => match outcome {
                Ok(Ok(value)) => {
                    self.on_result(true);
                    Ok(value)
                }
                Ok(Err(err)) => {
                    self.on_result(false);
                    Err(err)
                }
                Err(_) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.total_timeouts += 1;
                    }
                    self.on_result(false);
                    let err = GatewayError::Timeout(format!(
                        "call through breaker '{}' exceeded {:?}",
                        self.name, self.config.timeout
                    ));
                    match fallback {
                        Some(fallback) => fallback(&err),
                        None => Err(err),
                    }
                }
            }
        }
    }

    /// Admission check. Returns the rejection error when the circuit is open;
    /// transitions open → half-open once the reset timeout has elapsed.
    fn admit(&self) -> Option<GatewayError> {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;

        if inner.state != BreakerState::Open {
            return None;
        }

        let now = Instant::now();
        match inner.next_attempt_at {
            Some(next_attempt) if now < next_attempt => {
                inner.total_rejected += 1;
                Some(GatewayError::CircuitOpen {
                    name: self.name.clone(),
                    retry_after: next_attempt - now,
                })
            }
            _ => {
                Self::set_state(&self.name, &self.config, &mut inner, BreakerState::HalfOpen);
                None
            }
        }
    }

    fn on_result(&self, success: bool) {
        let mut inner = self.inner.lock();
        if success {
            inner.total_successes += 1;
            match inner.state {
                BreakerState::Closed => inner.failures = 0,
                BreakerState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.success_threshold {
                        Self::set_state(&self.name, &self.config, &mut inner, BreakerState::Closed);
                    }
                }
                BreakerState::Open => {}
            }
        } else {
            inner.failures += 1;
            inner.total_failures += 1;
            inner.last_failure_at = Some(Instant::now());
            inner.successes = 0;
            match inner.state {
                BreakerState::Closed if inner.failures >= self.config.max_failures => {
                    Self::set_state(&self.name, &self.config, &mut inner, BreakerState::Open);
                }
                BreakerState::HalfOpen => {
                    Self::set_state(&self.name, &self.config, &mut inner, BreakerState::Open);
                }
                _ => {}
            }
        }
    }

    fn set_state(name: &str, config: &BreakerConfig, inner: &mut BreakerInner, state: BreakerState) {
        let previous = inner.state;
        inner.state = state;

        match state {
            BreakerState::Open => {
                inner.next_attempt_at = Some(Instant::now() + config.reset_timeout);
                tracing::warn!(
                    breaker = name,
                    failures = inner.failures,
                    reset_timeout_secs = config.reset_timeout.as_secs_f64(),
                    "circuit breaker opened"
                );
            }
            BreakerState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
                tracing::info!(breaker = name, "circuit breaker closed");
            }
            BreakerState::HalfOpen => {
                inner.successes = 0;
                tracing::info!(breaker = name, "circuit breaker half-open");
            }
        }

        if previous != state {
            tracing::info!(
                breaker = name,
                from = previous.as_str(),
                to = state.as_str(),
                "circuit breaker state changed"
            );
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            consecutive_successes: inner.successes,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_timeouts: inner.total_timeouts,
            total_rejected: inner.total_rejected,
            last_failure_age_secs: inner.last_failure_at.map(|at| at.elapsed().as_secs_f64()),
        }
    }

    /// Manually force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::set_state(&self.name, &self.config, &mut inner, BreakerState::Closed);
        tracing::info!(breaker = %self.name, "circuit breaker manually reset");
    }
}

/// Lazily creates and owns the per-service breakers.
pub struct BreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    enabled: bool,
}

impl BreakerManager {
    #[must_use]
    pub fn new(config: BreakerConfig, enabled: bool) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), config, enabled }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            tracing::info!(
                breaker = name,
                max_failures = self.config.max_failures,
                "created circuit breaker"
            );
            Arc::new(CircuitBreaker::new(name, self.config.clone()))
        }))
    }

    /// Run a call through the named breaker, or directly when the manager is
    /// disabled.
    pub async fn call<T, F>(&self, name: &str, cancel: &CancellationToken, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.enabled {
            return call.await;
        }
        self.get_or_create(name).call(cancel, call).await
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    #[must_use]
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> =
            self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset one breaker to closed.
    pub fn reset(&self, name: &str) -> Result<()> {
        self.get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("circuit breaker '{name}'")))?
            .reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_millis(100),
            success_threshold: 2,
            timeout: Duration::from_secs(5),
        }
    }

    async fn failing_call(breaker: &CircuitBreaker) -> Result<u32> {
        breaker
            .call(&CancellationToken::new(), async {
                Err::<u32, _>(GatewayError::Transport("connection refused".into()))
            })
            .await
    }

    async fn succeeding_call(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(&CancellationToken::new(), async { Ok(7) }).await
    }

    #[tokio::test]
    async fn opens_after_max_failures_not_sooner() {
        let breaker = CircuitBreaker::new("svc", config());

        for _ in 0..2 {
            failing_call(&breaker).await.unwrap_err();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        failing_call(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_rejects_then_half_open_recovers() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected while the reset timeout has not elapsed.
        let err = succeeding_call(&breaker).await.unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::CircuitOpen);
        assert!(err.retry_after().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;

        // First probe succeeds: half-open, still not closed.
        succeeding_call(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Second consecutive success reaches the threshold.
        succeeding_call(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        failing_call(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn closed_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("svc", config());
        failing_call(&breaker).await.unwrap_err();
        failing_call(&breaker).await.unwrap_err();
        succeeding_call(&breaker).await.unwrap();
        failing_call(&breaker).await.unwrap_err();
        failing_call(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_surfaces_timeout() {
        let breaker = CircuitBreaker::new(
            "svc",
            BreakerConfig { timeout: Duration::from_millis(20), ..config() },
        );

        let err = breaker
            .call(&CancellationToken::new(), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(0u32)
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), specgate_core::ErrorKind::Timeout);
        let stats = breaker.stats();
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.total_failures, 1);
    }

    #[tokio::test]
    async fn fallback_replaces_open_rejection() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap_err();
        }

        let value = breaker
            .call_with_fallback(
                &CancellationToken::new(),
                async { Ok(0u32) },
                Some(|_err: &GatewayError| Ok(42u32)),
            )
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn cancellation_surfaces_cancelled() {
        let breaker = CircuitBreaker::new("svc", config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = breaker
            .call(&cancel, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(0u32)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn rejected_calls_are_counted() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap_err();
        }
        succeeding_call(&breaker).await.unwrap_err();

        let stats = breaker.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn disabled_manager_bypasses_breakers() {
        let manager = BreakerManager::new(config(), false);
        for _ in 0..10 {
            let err = manager
                .call("svc", &CancellationToken::new(), async {
                    Err::<u32, _>(GatewayError::Transport("down".into()))
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), specgate_core::ErrorKind::Transport);
        }
        assert!(manager.get("svc").is_none());
    }

    #[tokio::test]
    async fn manager_reuses_breakers_per_name() {
        let manager = BreakerManager::new(config(), true);
        let a = manager.get_or_create("svc");
        let b = manager.get_or_create("svc");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.all_stats().len(), 1);
        assert!(manager.reset("missing").is_err());
        assert!(manager.reset("svc").is_ok());
    }
}
