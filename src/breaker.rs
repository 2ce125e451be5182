//! Per-(backend, model) circuit breaker and its lazily-populated registry.
//!
//! Callers pair one `allow_request` with exactly one of `record_success` /
//! `record_failure`. State transitions are computed under the breaker's lock;
//! the guarded backend call itself runs without it, so a slow upstream never
//! blocks admission decisions for other callers.

use crate::cooldown::cooldown_key;
use crate::time::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            half_open_max: 3,
        }
    }
}

impl BreakerConfig {
    /// Replace non-positive values with the defaults.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: if self.failure_threshold == 0 {
                defaults.failure_threshold
            } else {
                self.failure_threshold
            },
            success_threshold: if self.success_threshold == 0 {
                defaults.success_threshold
            } else {
                self.success_threshold
            },
            open_timeout: if self.open_timeout.is_zero() {
                defaults.open_timeout
            } else {
                self.open_timeout
            },
            half_open_max: if self.half_open_max == 0 {
                defaults.half_open_max
            } else {
                self.half_open_max
            },
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_inflight: u32,
    last_transition_millis: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.sanitized();
        let now = clock.now_millis();
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_inflight: 0,
                last_transition_millis: now,
            }),
            config,
            clock,
        }
    }

    /// Admission check. Open circuits transition to half-open once the open
    /// timeout has elapsed; half-open admits at most `half_open_max`
    /// concurrent probes.
    pub fn allow_request(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("CircuitBreaker.allow_request: lock poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.last_transition_millis);
                if elapsed >= self.config.open_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.half_open_inflight = 1;
                    inner.last_transition_millis = now;
                    tracing::info!("circuit breaker open -> half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_inflight < self.config.half_open_max {
                    inner.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("CircuitBreaker.record_success: lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.half_open_inflight = 0;
                    inner.last_transition_millis = now;
                    tracing::info!("circuit breaker half-open -> closed");
                }
            }
            // A probe admitted before the state flipped; nothing to count.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("CircuitBreaker.record_failure: lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    let failures = inner.failures;
                    inner.state = CircuitState::Open;
                    inner.last_transition_millis = now;
                    tracing::warn!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker closed -> open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failures = 0;
                inner.successes = 0;
                inner.half_open_inflight = 0;
                inner.last_transition_millis = now;
                tracing::warn!("circuit breaker half-open -> open");
            }
            CircuitState::Open => {}
        }
    }

    /// Operational override: back to closed with clean counters.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("CircuitBreaker.reset: lock poisoned");
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_inflight = 0;
        inner.last_transition_millis = now;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("CircuitBreaker.state: lock poisoned").state
    }
}

/// Registry of breakers keyed `"backend/model"`, created lazily on first
/// touch. Concurrent first-touches converge on a single instance via a
/// double-checked insert.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: RwLock<BreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config: RwLock::new(config.sanitized()),
            clock,
        }
    }

    pub fn get(&self, backend: &str, model: &str) -> Arc<CircuitBreaker> {
        let key = cooldown_key(backend, model);
        {
            let breakers = self.breakers.read().expect("BreakerRegistry.get: lock poisoned");
            if let Some(breaker) = breakers.get(&key) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write().expect("BreakerRegistry.get: lock poisoned");
        let config = self.config.read().expect("BreakerRegistry.get: config lock poisoned").clone();
        let clock = Arc::clone(&self.clock);
        Arc::clone(
            breakers
                .entry(key)
                .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(config, clock))),
        )
    }

    /// Reset a breaker by its `"backend/model"` key. False when unknown.
    pub fn reset(&self, key: &str) -> bool {
        let breakers = self.breakers.read().expect("BreakerRegistry.reset: lock poisoned");
        match breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Breaker states sorted by key, for the admin surface.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.read().expect("BreakerRegistry.snapshot: lock poisoned");
        let mut entries: Vec<(String, CircuitState)> =
            breakers.iter().map(|(key, breaker)| (key.clone(), breaker.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// New thresholds apply to breakers created after the call; existing
    /// instances keep the configuration they were born with.
    pub fn reconfigure(&self, config: BreakerConfig) {
        *self.config.write().expect("BreakerRegistry.reconfigure: lock poisoned") =
            config.sanitized();
    }
}
