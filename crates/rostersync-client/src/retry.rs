//! Bounded reconnection policy.
//!
//! Failures are retried immediately (or after a fixed delay, if configured)
//! until the count of consecutive failures exceeds `max_retries`; the session
//! then gives up for good.

use std::time::Duration;

/// Default cap on consecutive retries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
    /// Pause before each retry; zero retries immediately
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given cap and no delay.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::ZERO,
        }
    }

    /// Same policy with a fixed delay between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; `attempt` is the 1-based retry number
    Retry {
        /// Retry number since the last successful connect
        attempt: u32,
    },
    /// Cap exceeded
    GiveUp {
        /// Consecutive failures observed
        failures: u32,
    },
}

/// Counts consecutive failures against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryCounter {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryCounter {
    /// Start counting from zero.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record one failure and decide whether to retry.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.policy.max_retries {
            RetryDecision::GiveUp {
                failures: self.failures,
            }
        } else {
            RetryDecision::Retry {
                attempt: self.failures,
            }
        }
    }

    /// A connection succeeded.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Pause before the next attempt.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.policy.delay
    }
}
