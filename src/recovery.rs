// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Recovery primitives
//!
//! [`RetryStrategy`] spaces out repeated transmissions of one packet to the
//! same gateway. [`CircuitBreaker`] keeps the gateway forwarder from
//! hammering a backend that stopped answering: after enough consecutive
//! failed posts it stays open for a pause, then lets one trial post through.

use std::time::{Duration, Instant};

/// Where the breaker stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Backend healthy, every post goes out
    #[default]
    Closed,
    /// Backend considered down until the pause elapses
    Open,
    /// Pause over; the next post decides
    HalfOpen,
}

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failed posts that open the circuit
    pub failure_threshold: u32,
    /// Successful trial posts needed to close it again
    pub trial_successes: u32,
    /// How long the circuit stays open
    pub open_for: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            trial_successes: 1,
            open_for: Duration::from_secs(5),
        }
    }
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    consecutive_failures: u32,
    trials_passed: u32,
    reopens_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Closed breaker with default tuning
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trials_passed: 0,
            reopens_at: None,
        }
    }

    /// Whether a post may be attempted now.
    ///
    /// An open circuit whose pause has run out turns half-open here.
    pub fn should_allow(&mut self) -> bool {
        if self.state != CircuitState::Open {
            return true;
        }
        if self.remaining_open_time().is_some() {
            return false;
        }
        log::debug!("backend pause over, trying again");
        self.state = CircuitState::HalfOpen;
        self.trials_passed = 0;
        true
    }

    /// Time until an open circuit lets a trial post through, `None` otherwise
    pub fn remaining_open_time(&self) -> Option<Duration> {
        match (self.state, self.reopens_at) {
            (CircuitState::Open, Some(at)) => {
                let left = at.saturating_duration_since(Instant::now());
                (!left.is_zero()).then_some(left)
            }
            _ => None,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.trials_passed += 1;
            if self.trials_passed >= self.config.trial_successes {
                log::info!("backend reachable again, circuit closed");
                self.state = CircuitState::Closed;
                self.reopens_at = None;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trip = match self.state {
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            log::warn!(
                "backend failed {} time(s) in a row, pausing posts for {:?}",
                self.consecutive_failures,
                self.config.open_for
            );
            self.state = CircuitState::Open;
            self.reopens_at = Some(Instant::now() + self.config.open_for);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failed posts since the last success
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Doubling backoff between transmissions to one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryStrategy {
    /// Retries after the first transmission
    pub retries: u32,
    /// Wait before the first retry
    pub first_delay: Duration,
    /// Ceiling for any single wait
    pub max_delay: Duration,
}

impl RetryStrategy {
    /// `retries` retries starting at `first_delay`, doubling each time
    pub fn exponential(retries: u32, first_delay: Duration) -> Self {
        Self {
            retries,
            first_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Wait before retry number `attempt` (0-based), `None` once exhausted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.first_delay.saturating_mul(factor).min(self.max_delay))
    }
}
