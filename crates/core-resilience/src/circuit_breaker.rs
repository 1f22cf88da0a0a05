//! Keyed circuit breaker for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! backend is experiencing issues. One breaker exists per connection key and
//! has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Backend is unhealthy, requests fail immediately
//! - HalfOpen: Exactly one probe request is testing recovery
//!
//! Unlike a retrying breaker, this one separates admission from outcome:
//! the dispatcher calls [`CircuitBreaker::admit`] before touching the
//! backend and reports [`CircuitBreaker::record_success`] /
//! [`CircuitBreaker::record_failure`] afterwards. Cancellations and client
//! errors are simply never reported, so they cannot trip the breaker.

use super::error::ResilienceError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// State of a single circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately until the open timeout
    Open { opened_at: Instant },
    /// Circuit is half-open; the single probe is in flight
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to wait in Open before admitting a probe
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Internal state of one circuit
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
}

/// Circuit breaker for a single connection key.
///
/// State transitions are serialized by the internal mutex; the critical
/// section never awaits.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// The key this breaker guards
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the current state of the circuit
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Get the current consecutive failure count
    pub async fn failure_count(&self) -> usize {
        self.inner.lock().await.consecutive_failures
    }

    /// Ask the breaker to admit a call.
    ///
    /// - Closed admits every call.
    /// - Open rejects with [`ResilienceError::CircuitOpen`] until the open
    ///   timeout elapses; the first admission after that claims the single
    ///   half-open probe.
    /// - HalfOpen rejects further admissions while the probe is in flight.
    pub async fn admit(&self) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_timeout {
                    // This admission becomes the probe.
                    inner.state = CircuitState::HalfOpen;
                    debug!(key = %self.key, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen {
                        key: self.key.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => Err(ResilienceError::CircuitOpen {
                key: self.key.clone(),
            }),
        }
    }

    /// Report a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                debug!(key = %self.key, "probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
            }
            CircuitState::Open { .. } => {
                // A success reported while Open belongs to a call admitted
                // before the trip; it does not re-close the circuit.
            }
        }
    }

    /// Report a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        key = %self.key,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            CircuitState::HalfOpen => {
                warn!(key = %self.key, "probe failed, reopening circuit");
                inner.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Reset the circuit to closed state
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
    }
}

/// Registry of per-key circuit breakers.
///
/// Breakers are created lazily on first admission for a key. Cross-key
/// updates are independent; per-key transitions are serialized by the
/// breaker's own lock.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a key
    pub async fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// Admit a call for a key
    pub async fn admit(&self, key: &str) -> Result<(), ResilienceError> {
        self.breaker(key).await.admit().await
    }

    /// Report a successful call for a key
    pub async fn record_success(&self, key: &str) {
        self.breaker(key).await.record_success().await;
    }

    /// Report a failed call for a key
    pub async fn record_failure(&self, key: &str) {
        self.breaker(key).await.record_failure().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: usize, timeout_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            open_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_closed_admits_all() {
        let breaker = CircuitBreaker::new("k", config(3, 100));
        for _ in 0..10 {
            assert!(breaker.admit().await.is_ok());
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_closed_to_open_at_threshold() {
        let breaker = CircuitBreaker::new("k", config(3, 100));

        for _ in 0..2 {
            breaker.record_failure().await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }
        breaker.record_failure().await;

        match breaker.state().await {
            CircuitState::Open { .. } => (),
            state => panic!("expected Open, got {:?}", state),
        }
        assert!(matches!(
            breaker.admit().await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("k", config(3, 100));

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        assert_eq!(breaker.failure_count().await, 0);

        // Two more failures do not reach the threshold of three.
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_until_timeout() {
        let breaker = CircuitBreaker::new("k", config(1, 50));
        breaker.record_failure().await;

        assert!(matches!(
            breaker.admit().await,
            Err(ResilienceError::CircuitOpen { .. })
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First admission after the timeout is the probe.
        assert!(breaker.admit().await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new("k", config(1, 50));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(breaker.admit().await.is_ok());
        // Concurrent admissions while the probe is in flight are rejected.
        assert!(matches!(
            breaker.admit().await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
        assert!(matches!(
            breaker.admit().await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new("k", config(1, 50));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.admit().await.unwrap();
        breaker.record_success().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("k", config(1, 50));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.admit().await.unwrap();
        breaker.record_failure().await;

        match breaker.state().await {
            CircuitState::Open { .. } => (),
            state => panic!("expected Open, got {:?}", state),
        }
        // Freshly reopened: rejects again until a new timeout elapses.
        assert!(breaker.admit().await.is_err());
    }

    #[tokio::test]
    async fn test_registry_keys_are_independent() {
        let registry = BreakerRegistry::new(config(1, 100));

        registry.record_failure("a").await;
        assert!(matches!(
            registry.admit("a").await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
        assert!(registry.admit("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_registry_reuses_breaker_instance() {
        let registry = BreakerRegistry::new(config(3, 100));
        let a1 = registry.breaker("a").await;
        let a2 = registry.breaker("a").await;
        assert!(Arc::ptr_eq(&a1, &a2));
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new("k", config(1, 1_000));
        breaker.record_failure().await;
        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }
}
