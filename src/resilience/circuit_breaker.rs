// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consecutive-failure circuit breaker for sync targets.
//!
//! A target that fails `failure_threshold` times in a row is put into a
//! cooldown during which it is skipped entirely. Once the cooldown has
//! elapsed the next admission check closes the circuit again and resets the
//! failure counter, giving the target a fresh set of attempts.
//!
//! States:
//! - Active: triggers pass through
//! - Cooling: triggers are rejected until the cooldown deadline

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state for stats and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Active = 0,
    Cooling = 1,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cooling => write!(f, "cooling"),
        }
    }
}

/// Configuration for a target breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of consecutive failures that trips the breaker
    pub failure_threshold: u32,
    /// How long a tripped target is skipped
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(120),
        }
    }
}

impl BreakerConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the refresh. `recovered` is set when this check ended a cooldown.
    Allowed { recovered: bool },
    /// Target is cooling down.
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_errors: u32,
    cooling_until: Option<Instant>,
}

/// Breaker for one sync target, labelled by the target's name.
pub struct TargetBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl TargetBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                consecutive_errors: 0,
                cooling_until: None,
            }),
        }
    }

    /// Current state. A cooldown whose deadline has passed still reports
    /// `Cooling` until the next [`admit`](Self::admit) closes it.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        if self.inner.lock().cooling_until.is_some() {
            CircuitState::Cooling
        } else {
            CircuitState::Active
        }
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().consecutive_errors
    }

    /// Check whether a refresh may run now, ending an elapsed cooldown.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.cooling_until {
            Some(until) if Instant::now() < until => {
                debug!(circuit = %self.name, "Breaker rejected trigger (cooling)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Admission::Rejected
            }
            Some(_) => {
                inner.cooling_until = None;
                inner.consecutive_errors = 0;
                info!(circuit = %self.name, "Cooldown elapsed, target re-enabled");
                crate::metrics::set_circuit_state(&self.name, CircuitState::Active as u8);
                Admission::Allowed { recovered: true }
            }
            None => Admission::Allowed { recovered: false },
        }
    }

    pub fn record_success(&self) {
        self.inner.lock().consecutive_errors = 0;
        crate::metrics::record_circuit_call(&self.name, "success");
    }

    /// Count a failure. Returns `true` when this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        crate::metrics::record_circuit_call(&self.name, "failure");

        let mut inner = self.inner.lock();
        inner.consecutive_errors += 1;
        if inner.cooling_until.is_none() && inner.consecutive_errors >= self.config.failure_threshold {
            inner.cooling_until = Some(Instant::now() + self.config.cooldown);
            warn!(
                circuit = %self.name,
                errors = inner.consecutive_errors,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Consecutive failures, temporarily disabling target"
            );
            crate::metrics::set_circuit_state(&self.name, CircuitState::Cooling as u8);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stays_active_below_threshold() {
        let breaker = TargetBreaker::new("leads", BreakerConfig::default());

        assert_eq!(breaker.admit(), Admission::Allowed { recovered: false });
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());

        assert_eq!(breaker.state(), CircuitState::Active);
        assert_eq!(breaker.consecutive_errors(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let breaker = TargetBreaker::new("leads", BreakerConfig::default());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        assert_eq!(breaker.consecutive_errors(), 0);
        assert!(!breaker.record_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_and_rejects_during_cooldown() {
        let breaker = TargetBreaker::new("leads", BreakerConfig::default());

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Cooling);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(breaker.admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.admit(), Admission::Allowed { recovered: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_cooldown_with_fresh_counter() {
        let breaker = TargetBreaker::new("leads", BreakerConfig::test());

        breaker.record_failure();
        assert!(breaker.record_failure());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(breaker.admit(), Admission::Allowed { recovered: true });
        assert_eq!(breaker.state(), CircuitState::Active);
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_while_cooling_do_not_extend_cooldown() {
        let breaker = TargetBreaker::new("orders", BreakerConfig::test());

        breaker.record_failure();
        assert!(breaker.record_failure());
        tokio::time::advance(Duration::from_millis(30)).await;
        // a refresh already in flight when the breaker tripped
        assert!(!breaker.record_failure());

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(breaker.admit(), Admission::Allowed { recovered: true });
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Active.to_string(), "active");
        assert_eq!(CircuitState::Cooling.to_string(), "cooling");
    }
}
