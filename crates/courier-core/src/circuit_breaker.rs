// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure-rate circuit breaker for listeners.
//!
//! Outcomes are kept in a rolling window of `tracking_period`. Once the
//! window holds at least `minimum_threshold` outcomes and the failure share
//! reaches `failure_percentage_threshold`, the breaker trips and the owning
//! listener pauses for `pause_time`. After the pause the window starts over.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Circuit breaker tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerOptions {
    /// Failure share, in percent, that trips the breaker.
    pub failure_percentage_threshold: u8,
    /// Outcomes required in the window before the breaker may trip.
    pub minimum_threshold: usize,
    /// Length of the rolling window.
    pub tracking_period: Duration,
    /// How long the listener stays paused after a trip.
    pub pause_time: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_percentage_threshold: 10,
            minimum_threshold: 10,
            tracking_period: Duration::from_secs(600),
            pause_time: Duration::from_secs(180),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Recording outcomes.
    Closed,
    /// Tripped; outcomes are ignored until [`CircuitBreaker::half_open`].
    Open,
}

/// Rolling-window circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    samples: VecDeque<(Instant, bool)>,
    failures: usize,
    state: BreakerState,
}

impl CircuitBreaker {
    /// New closed breaker.
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            samples: VecDeque::new(),
            failures: 0,
            state: BreakerState::Closed,
        }
    }

    /// Options in effect.
    pub fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Record one outcome. Returns true when this outcome trips the breaker.
    pub fn record(&mut self, success: bool, now: Instant) -> bool {
        if self.state == BreakerState::Open {
            return false;
        }

        self.samples.push_back((now, success));
        if !success {
            self.failures += 1;
        }
        self.evict(now);

        let total = self.samples.len();
        if total < self.options.minimum_threshold.max(1) {
            return false;
        }

        let failure_percentage = self.failures * 100 / total;
        if failure_percentage >= usize::from(self.options.failure_percentage_threshold) {
            tracing::warn!(
                failures = self.failures,
                total = total,
                threshold = self.options.failure_percentage_threshold,
                pause_secs = self.options.pause_time.as_secs(),
                "Failure threshold exceeded - opening circuit breaker"
            );
            self.state = BreakerState::Open;
            return true;
        }
        false
    }

    /// Close the breaker with an empty window.
    pub fn half_open(&mut self) {
        self.samples.clear();
        self.failures = 0;
        self.state = BreakerState::Closed;
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, success)) = self.samples.front() {
            if now.saturating_duration_since(at) <= self.options.tracking_period {
                break;
            }
            self.samples.pop_front();
            if !success {
                self.failures -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            failure_percentage_threshold: 50,
            minimum_threshold: 4,
            tracking_period: Duration::from_secs(60),
            pause_time: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_does_not_trip_below_minimum() {
        let mut breaker = CircuitBreaker::new(options());
        let now = Instant::now();
        assert!(!breaker.record(false, now));
        assert!(!breaker.record(false, now));
        assert!(!breaker.record(false, now));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.record(false, now));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_trips_on_failure_share() {
        let mut breaker = CircuitBreaker::new(options());
        let now = Instant::now();
        assert!(!breaker.record(true, now));
        assert!(!breaker.record(true, now));
        assert!(!breaker.record(true, now));
        assert!(!breaker.record(false, now));
        assert!(!breaker.record(false, now));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.record(false, now));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_old_samples_leave_the_window() {
        let mut breaker = CircuitBreaker::new(options());
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record(false, start);
        }
        let later = start + Duration::from_secs(120);
        assert!(!breaker.record(true, later));
        assert!(!breaker.record(true, later));
        assert!(!breaker.record(true, later));
        assert!(!breaker.record(false, later));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_resets_window() {
        let mut breaker = CircuitBreaker::new(options());
        let now = Instant::now();
        for _ in 0..4 {
            breaker.record(false, now);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.record(false, now));

        breaker.half_open();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(!breaker.record(false, now));
    }
}
