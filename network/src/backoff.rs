//! Exponential backoff between connection attempts.
//!
//! The delay before retry `attempt` (starting at zero) is `initial * multiplier^attempt`, capped
//! at `max`. A policy with a zero `initial` delay is disabled: the first failure is final. A zero
//! `max` places no cap above `initial`, so every retry waits `initial`.

use std::time::Duration;

/// Pure retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
}

impl Backoff {
    /// Create a new policy.
    pub const fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Create a policy that never retries.
    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1)
    }

    /// Returns whether retries are disabled.
    pub const fn is_disabled(&self) -> bool {
        self.initial.is_zero()
    }

    /// Returns the largest delay the policy hands out.
    fn cap(&self) -> Duration {
        if self.max.is_zero() {
            return self.initial;
        }
        self.max
    }

    /// Returns the delay before the given retry, or `None` if retries are disabled.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.is_disabled() {
            return None;
        }
        let cap = self.cap();
        let delay = match self.multiplier.checked_pow(attempt) {
            Some(factor) => self.initial.saturating_mul(factor),
            None => cap,
        };
        Some(delay.min(cap))
    }

    /// Start a new sequence of attempts, optionally bounded to `max_retries` retries.
    pub const fn schedule(self, max_retries: Option<u32>) -> Schedule {
        Schedule {
            policy: self,
            max_retries,
            attempt: 0,
        }
    }
}

/// Position in a sequence of retries.
#[derive(Clone, Debug)]
pub struct Schedule {
    policy: Backoff,
    max_retries: Option<u32>,
    attempt: u32,
}

impl Schedule {
    /// Returns the number of retries already handed out.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the delay before the next retry without advancing.
    pub fn peek(&self) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        self.policy.delay(self.attempt)
    }

    /// Advance after a failure, returning the delay to wait or `None` if no retry remains.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.peek()?;
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Restart the sequence after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
