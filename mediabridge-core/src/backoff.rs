//! Reconnection backoff
//!
//! [`BackoffPolicy::next_interval`] is a pure function: callers keep the
//! returned delay and pass it back as `previous` on the next failure.
//! [`ReconnectSchedule`] pairs the policy with an attempt budget so a bridge
//! knows when to stop retrying and report a terminal failure.

use std::time::Duration;

/// Multiplicative backoff with a floor and a ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    growth_factor: f64,
}

impl BackoffPolicy {
    /// Create a policy
    ///
    /// A growth factor below 1.0 (or non-finite) is treated as 1.0 and a
    /// ceiling below the base is raised to the base.
    #[must_use]
    pub fn new(base: Duration, max: Duration, growth_factor: f64) -> Self {
        let growth_factor = if growth_factor.is_finite() && growth_factor >= 1.0 {
            growth_factor
        } else {
            1.0
        };
        Self {
            base,
            max: max.max(base),
            growth_factor,
        }
    }

    /// Smallest interval
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Largest interval
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Growth factor
    #[must_use]
    pub fn growth_factor(&self) -> f64 {
        self.growth_factor
    }

    /// Next retry delay given the previous one
    ///
    /// `min(max(previous, base) * growth_factor, max)`
    #[must_use]
    pub fn next_interval(&self, previous: Duration) -> Duration {
        let from = previous.max(self.base);
        if from >= self.max {
            return self.max;
        }
        // mul_f64 would panic on overflow
        let grown = Duration::try_from_secs_f64(from.as_secs_f64() * self.growth_factor)
            .unwrap_or(self.max);
        grown.max(from).min(self.max)
    }
}

/// Attempt-bounded retry schedule for one connection effort
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempts: u32,
    previous: Duration,
}

impl ReconnectSchedule {
    /// Create a schedule allowing `max_attempts` connection attempts in total
    #[must_use]
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempts: 0,
            previous: Duration::ZERO,
        }
    }

    /// Record a connection attempt
    ///
    /// Returns `false` once the attempt budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Delay before the next attempt after a failure
    ///
    /// The first retry waits the base interval, later ones grow from the
    /// previous delay. `None` when no attempts remain; the caller must then
    /// report a terminal failure.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.previous = if self.previous.is_zero() {
            self.policy.base()
        } else {
            self.policy.next_interval(self.previous)
        };
        Some(self.previous)
    }

    /// Attempts made so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Last delay handed out
    #[must_use]
    pub fn previous(&self) -> Duration {
        self.previous
    }
}
