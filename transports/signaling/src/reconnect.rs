//! Reconnection policy and per-channel attempt budget
//!
//! The policy is a pure calculator: given an attempt number it yields the
//! delay before that attempt, or [`Backoff::Stop`] once the budget is spent.
//! A [`ReconnectionBudget`] pairs the policy with the mutable attempt counter
//! owned by exactly one channel.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of asking the policy for the next retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this long, then try again
    Retry(Duration),
    /// Attempt budget exhausted; the channel stays Disconnected
    Stop,
}

/// Reconnection policy configuration
///
/// `next_delay(attempt) = min(base_delay_ms * 2^attempt, cap_delay_ms)` for
/// `attempt < max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts
    pub max_attempts: u32,
    /// Delay before the first attempt in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds
    pub cap_delay_ms: u64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::presence()
    }
}

impl ReconnectionPolicy {
    /// Policy used by the call signaling channel
    pub fn session() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
            cap_delay_ms: 30000,
        }
    }

    /// Policy used by the presence channel (1s, 2s, 4s ... capped at 60s)
    pub fn presence() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            cap_delay_ms: 60000,
        }
    }

    /// Calculate the delay before `attempt` (0-indexed)
    pub fn next_delay(&self, attempt: u32) -> Backoff {
        if attempt >= self.max_attempts {
            return Backoff::Stop;
        }

        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.cap_delay_ms);

        Backoff::Retry(Duration::from_millis(delay_ms))
    }

    /// Check if more attempts are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Attempt counter for one channel
///
/// Incremented on every failed (re)connect, reset to zero exactly when the
/// channel reaches Connected. Never shared between channels.
#[derive(Debug, Clone)]
pub struct ReconnectionBudget {
    policy: ReconnectionPolicy,
    attempt: u32,
}

impl ReconnectionBudget {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts consumed since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Delay for the next attempt without consuming it
    pub fn peek(&self) -> Backoff {
        self.policy.next_delay(self.attempt)
    }

    /// Consume one attempt and return the delay to wait before making it
    pub fn next(&mut self) -> Backoff {
        let backoff = self.policy.next_delay(self.attempt);
        if let Backoff::Retry(_) = backoff {
            self.attempt += 1;
        }
        backoff
    }

    pub fn is_exhausted(&self) -> bool {
        !self.policy.should_retry(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
