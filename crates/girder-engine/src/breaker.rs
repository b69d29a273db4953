//! Circuit breaker
//!
//! Three-state breaker per named downstream. When consecutive failures
//! reach the threshold the circuit opens and calls fail fast; after the
//! reset timeout one probe stream is let through in half-open, and enough
//! consecutive successes close the circuit again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all calls allowed
    Closed,

    /// Failure threshold exceeded, all calls rejected
    Open,

    /// Testing whether the downstream recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes in half-open required to close it
    pub success_threshold: u32,

    /// Time to wait in open before probing with half-open
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Three-state circuit breaker for one named downstream
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
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decision point: whether a call may proceed right now.
    ///
    /// Returns false if and only if the circuit is open (and the recovery
    /// timeout has not yet elapsed).
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = %self.name, "recovery timeout elapsed, probing half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!(breaker = %self.name, "closing circuit");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.consecutive_successes = 0;
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures = inner.consecutive_failures, "opening circuit");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}

/// Registry mapping downstream names to shared breaker instances
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `name`, creating it with the default config
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Install a breaker with a specific config, replacing any existing one
    pub fn insert(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        let name = name.into();
        self.breakers
            .insert(name.clone(), Arc::new(CircuitBreaker::new(name, config)));
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_recovery_timeout(recovery),
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let b = breaker(3, 1, Duration::from_secs(60));
        assert_eq!(b.state(), CircuitState::Closed);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow_request());

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let b = breaker(3, 1, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let b = breaker(1, 1, Duration::ZERO);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        // Zero recovery timeout: next decision probes half-open.
        assert!(b.allow_request());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_on_success_threshold() {
        let b = breaker(1, 2, Duration::ZERO);
        b.record_failure();
        assert!(b.allow_request());

        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let b = breaker(1, 2, Duration::ZERO);
        b.record_failure();
        assert!(b.allow_request());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_allow_request_false_iff_open() {
        let b = breaker(1, 1, Duration::from_secs(60));
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_request());
        assert!(!b.allow_request());
    }

    #[test]
    fn test_deterministic_replay_of_outcome_sequence() {
        // Same outcome sequence, same state trajectory.
        let run = || {
            let b = breaker(2, 1, Duration::from_secs(60));
            let mut states = vec![];
            for outcome in [false, false, true, false, false] {
                if outcome {
                    b.record_success();
                } else {
                    b.record_failure();
                }
                states.push(b.state());
            }
            states
        };
        assert_eq!(run(), run());
        assert_eq!(
            run().last().copied(),
            Some(CircuitState::Open),
            "two trailing failures after a reset must open a threshold-2 breaker"
        );
    }

    #[test]
    fn test_registry_shares_instances() {
        let registry = BreakerRegistry::default();
        let a = registry.get("svc");
        let b = registry.get("svc");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
}
