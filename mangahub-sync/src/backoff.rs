//! Exponential backoff for reconnection.
//!
//! `delay(attempt) = min(base · 2^(attempt-1), max)`; attempt 1 waits `base`.

use std::time::Duration;

/// Reconnection timing and the attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Attempts allowed before reconnection reports terminal failure.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

/// Delay before reconnection attempt `attempt` (1-based). Attempt 0 is
/// the initial connect and does not wait.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Attempt counter owned by one client.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    attempt: u32,
    policy: BackoffPolicy,
}

impl ReconnectState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { attempt: 0, policy }
    }

    /// Claim the next attempt and return how long to wait before it, or
    /// `None` once the ceiling is reached. The counter never exceeds
    /// `max_attempts`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(backoff_delay(self.attempt, self.policy.base, self.policy.max))
    }

    /// Called after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
