//! Pluggable reconnect policies.
//!
//! Policies are stateless and side-effect free; the attempt counter
//! lives in the owning connection. `attempt` is the 1-based ordinal of
//! the transport connect about to fire in the current reconnect cycle,
//! so `max_attempts` bounds the total attempts per cycle: with
//! `max_attempts = 2` the initial attempt and one scheduled retry may
//! run, and the next evaluation reports exhaustion.

use std::time::Duration;

/// Decides whether and when a failed connect is retried.
pub trait RetryPolicy: Send + Sync {
    /// Total transport-connect attempts allowed per reconnect cycle.
    fn max_attempts(&self) -> u32;

    /// Whether the given attempt is still within budget.
    fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts()
    }

    /// How long to wait before the given attempt fires.
    fn delay(&self, attempt: u32) -> Duration;
}

// ── ConstantRetry ────────────────────────────────────────────────

/// Fixed delay between attempts. The stock policy.
#[derive(Debug, Clone)]
pub struct ConstantRetry {
    max_attempts: u32,
    delay: Duration,
}

impl ConstantRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for ConstantRetry {
    /// Three attempts, five seconds apart.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

impl RetryPolicy for ConstantRetry {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

// ── ExponentRetry ────────────────────────────────────────────────

/// Doubling backoff: the first scheduled retry waits `initial_delay`,
/// each one after that waits twice the previous delay.
#[derive(Debug, Clone)]
pub struct ExponentRetry {
    max_attempts: u32,
    initial_delay: Duration,
}

impl ExponentRetry {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }
}

impl Default for ExponentRetry {
    /// Three attempts starting from a one second delay.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy for ExponentRetry {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        // Attempt 2 is the first scheduled retry. Shift capped so the
        // multiplier cannot overflow.
        let exp = attempt.saturating_sub(2).min(16);
        self.initial_delay.saturating_mul(1u32 << exp)
    }
}

// ── Tests ────────────────────────────────────────────────────────
