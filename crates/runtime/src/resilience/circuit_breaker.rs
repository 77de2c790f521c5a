//! Circuit breaker guarding job runs.
//!
//! Standard Closed → Open → Half-Open state machine with an additional
//! in-flight cap that rejects regardless of state. When disabled in config,
//! `acquire` hands out pass-through permits and records nothing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::types::ResilienceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    #[serde(with = "humantime_serde", default = "default_recovery_timeout")]
    pub recovery_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    #[serde(default = "default_half_open_max")]
    pub half_open_max: u32,
    /// Consecutive probe successes required to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Reject when this many requests are already in flight, in any state.
    #[serde(default)]
    pub max_concurrent_requests: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max() -> u32 {
    2
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_max: default_half_open_max(),
            success_threshold: default_success_threshold(),
            max_concurrent_requests: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_probes: u32,
    half_open_successes: u32,
    last_state_change: DateTime<Utc>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
    in_flight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_probes: 0,
                half_open_successes: 0,
                last_state_change: now,
            }),
            in_flight: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Admit one call, or fast-fail. The permit must be finished with
    /// [`BreakerPermit::record`] (counts toward the state machine) or
    /// [`BreakerPermit::abandon`] (does not).
    pub fn acquire(self: &Arc<Self>) -> Result<BreakerPermit, ResilienceError> {
        if !self.config.enabled {
            return Ok(BreakerPermit {
                breaker: Arc::clone(self),
                counted: false,
                probing: false,
                done: false,
            });
        }

        if let Some(cap) = self.config.max_concurrent_requests {
            if self.in_flight.load(Ordering::SeqCst) >= cap {
                return Err(ResilienceError::CircuitOpen);
            }
        }

        let probing = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let elapsed = self.clock.now() - state.last_state_change;
                    if elapsed.to_std().unwrap_or_default() >= self.config.recovery_timeout {
                        state.state = CircuitState::HalfOpen;
                        state.half_open_probes = 1;
                        state.half_open_successes = 0;
                        state.last_state_change = self.clock.now();
                        tracing::info!("circuit breaker transitioning to half-open");
                        true
                    } else {
                        return Err(ResilienceError::CircuitOpen);
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_probes < self.config.half_open_max {
                        state.half_open_probes += 1;
                        true
                    } else {
                        return Err(ResilienceError::CircuitHalfOpenFull);
                    }
                }
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            counted: true,
            probing,
            done: false,
        })
    }

    fn on_result(&self, success: bool, probing: bool) {
        let mut state = self.state.lock();
        if probing {
            state.half_open_probes = state.half_open_probes.saturating_sub(1);
        }
        match state.state {
            CircuitState::Closed => {
                if success {
                    state.consecutive_failures = 0;
                } else {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        state.state = CircuitState::Open;
                        state.last_state_change = self.clock.now();
                        tracing::warn!(
                            failures = state.consecutive_failures,
                            "circuit breaker opened"
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= self.config.success_threshold {
                        state.state = CircuitState::Closed;
                        state.consecutive_failures = 0;
                        state.half_open_probes = 0;
                        state.half_open_successes = 0;
                        state.last_state_change = self.clock.now();
                        tracing::info!("circuit breaker closed after recovery");
                    }
                } else {
                    state.state = CircuitState::Open;
                    state.half_open_probes = 0;
                    state.half_open_successes = 0;
                    state.last_state_change = self.clock.now();
                    tracing::warn!("circuit breaker reopened: probe failed");
                }
            }
            CircuitState::Open => {
                if !success {
                    state.consecutive_failures += 1;
                }
            }
        }
    }

    fn release(&self, counted: bool) {
        if counted {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Outstanding admission. Dropping without recording behaves like `abandon`.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    counted: bool,
    probing: bool,
    done: bool,
}

impl BreakerPermit {
    /// Feed the action outcome into the state machine.
    pub fn record(mut self, success: bool) {
        self.done = true;
        self.breaker.release(self.counted);
        if self.counted {
            self.breaker.on_result(success, self.probing);
        }
    }

    /// Release without counting an outcome (the action never ran).
    pub fn abandon(mut self) {
        self.done = true;
        self.breaker.release(self.counted);
        if self.counted && self.probing {
            let mut state = self.breaker.state.lock();
            state.half_open_probes = state.half_open_probes.saturating_sub(1);
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.release(self.counted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn make_breaker(config: CircuitBreakerConfig) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default_epoch());
        let breaker = Arc::new(CircuitBreaker::new(config, clock.clone()));
        (breaker, clock)
    }

    fn fail_once(breaker: &Arc<CircuitBreaker>) {
        breaker.acquire().unwrap().record(false);
    }

    #[test]
    fn starts_closed_and_admits() {
        let (breaker, _clock) = make_breaker(CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.acquire().unwrap().record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_failure_threshold() {
        let (breaker, _clock) = make_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        });

        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(matches!(
            breaker.acquire(),
            Err(ResilienceError::CircuitOpen)
        ));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let (breaker, _clock) = make_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        });
        fail_once(&breaker);
        fail_once(&breaker);
        breaker.acquire().unwrap().record(true);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn recovery_timeout_moves_to_half_open_then_closes() {
        let (breaker, clock) = make_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(31));
        let permit = breaker.acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        permit.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let (breaker, clock) = make_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            ..CircuitBreakerConfig::default()
        });
        fail_once(&breaker);
        clock.advance(Duration::from_secs(31));

        let permit = breaker.acquire().unwrap();
        permit.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let (breaker, clock) = make_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_max: 2,
            success_threshold: 3,
            ..CircuitBreakerConfig::default()
        });
        fail_once(&breaker);
        clock.advance(Duration::from_secs(31));

        let first = breaker.acquire().unwrap();
        let second = breaker.acquire().unwrap();
        assert!(matches!(
            breaker.acquire(),
            Err(ResilienceError::CircuitHalfOpenFull)
        ));
        first.record(true);
        second.record(true);
    }

    #[test]
    fn in_flight_cap_rejects_in_any_state() {
        let (breaker, _clock) = make_breaker(CircuitBreakerConfig {
            max_concurrent_requests: Some(1),
            ..CircuitBreakerConfig::default()
        });
        let held = breaker.acquire().unwrap();
        assert!(matches!(
            breaker.acquire(),
            Err(ResilienceError::CircuitOpen)
        ));
        held.record(true);
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn disabled_breaker_bypasses_state_checks() {
        let (breaker, _clock) = make_breaker(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..10 {
            breaker.acquire().unwrap().record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn abandoned_permit_does_not_count_an_outcome() {
        let (breaker, _clock) = make_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        breaker.acquire().unwrap().abandon();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
