//! Per-institution circuit breakers.
//!
//! Stops the pipeline from hammering an endpoint that is systemically
//! down. Breakers are keyed by institution and evaluated before the rate
//! limiter, so open-breaker rejections never consume rate-limit budget.
//!
//! # Circuit states
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (one trial)
//!                                                                          |
//!                                        <--[trial failure]--              |
//!                                                                          |
//! CLOSED <--------------------------[trial success]------------------------+
//! ```
//!
//! `open` never transitions directly to `closed`: it must pass through
//! `half_open` and observe exactly one trial outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Current state of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected immediately, without a network attempt.
    Open,
    /// Exactly one trial call is permitted to probe recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait in `open` before admitting a trial call.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    /// Rejected without a network attempt; `retry_after` is the remaining
    /// open duration.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Receives state-transition events, decoupled from the breaker's
/// decision logic. Metrics subscribes through this.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, key: &str, from: CircuitState, to: CircuitState);
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn remaining_open(&self, reset_timeout: Duration) -> Duration {
        match self.opened_at {
            Some(at) => reset_timeout.saturating_sub(at.elapsed()),
            None => reset_timeout,
        }
    }
}

/// Snapshot of one breaker for monitoring.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub time_until_trial: Option<Duration>,
}

/// Circuit breakers keyed by institution, sharing one configuration and
/// observer list. Each key's state is mutated under its own lock.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerInner>>>>,
    observers: RwLock<Vec<Arc<dyn BreakerObserver>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    /// Decide whether a call for `key` may proceed.
    pub fn before_call(&self, key: &str) -> Admission {
        let breaker = self.breaker_entry(key);
        let mut inner = lock_inner(&breaker);

        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let remaining = inner.remaining_open(self.config.reset_timeout);
                if remaining.is_zero() {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    drop(inner);
                    tracing::info!(key, "Circuit breaker admitting trial call");
                    self.notify(key, CircuitState::Open, CircuitState::HalfOpen);
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        retry_after: remaining,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // One probe at a time; others back off for a full window.
                    Admission::Rejected {
                        retry_after: self.config.reset_timeout,
                    }
                } else {
                    inner.trial_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Record the outcome of a call previously admitted for `key`.
    pub fn on_result(&self, key: &str, success: bool) {
        let breaker = self.breaker_entry(key);
        let mut inner = lock_inner(&breaker);

        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    drop(inner);
                    tracing::warn!(
                        key,
                        failures,
                        "Circuit breaker opening after consecutive failures"
                    );
                    self.notify(key, CircuitState::Closed, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                drop(inner);
                tracing::info!(key, "Circuit breaker closed after successful trial");
                self.notify(key, CircuitState::HalfOpen, CircuitState::Closed);
            }
            (CircuitState::HalfOpen, false) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                drop(inner);
                tracing::warn!(key, "Circuit breaker trial failed, reopening");
                self.notify(key, CircuitState::HalfOpen, CircuitState::Open);
            }
            (CircuitState::Open, _) => {
                // Late result from a call admitted before the breaker opened.
            }
        }
    }

    /// Current state for `key`, without side effects on admission.
    pub fn state(&self, key: &str) -> CircuitState {
        let breaker = self.breaker_entry(key);
        let inner = lock_inner(&breaker);
        inner.state
    }

    /// Snapshot of every known breaker.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        let mut stats: Vec<BreakerStats> = breakers
            .iter()
            .map(|(key, breaker)| {
                let inner = lock_inner(breaker);
                BreakerStats {
                    key: key.clone(),
                    state: inner.state,
                    consecutive_failures: inner.consecutive_failures,
                    time_until_trial: (inner.state == CircuitState::Open)
                        .then(|| inner.remaining_open(self.config.reset_timeout)),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    fn breaker_entry(&self, key: &str) -> Arc<Mutex<BreakerInner>> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(breaker) = breakers.get(key) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerInner::new())))
            .clone()
    }

    fn notify(&self, key: &str, from: CircuitState, to: CircuitState) {
        let observers = self.observers.read().unwrap_or_else(|p| p.into_inner());
        for observer in observers.iter() {
            observer.on_transition(key, from, to);
        }
    }
}

fn lock_inner(breaker: &Arc<Mutex<BreakerInner>>) -> std::sync::MutexGuard<'_, BreakerInner> {
    breaker.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned breaker mutex");
        poisoned.into_inner()
    })
}
