//! Exponential back-off for connect attempts and retryable operations.
//!
//! A `Backoff` is consulted after each failed attempt: it either hands back the
//! wait before the next attempt or reports that the attempt budget is spent.
//! The overall deadline of an operation still applies on top of this.

use std::time::Duration;

use radx_common::ClusterConfig;

/// Attempt budget and wait schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_wait: Duration,
    /// Cap for the doubling wait.
    pub max_wait: Duration,
}

impl RetryPolicy {
    /// Policy used while establishing a connection.
    pub fn for_connect(config: &ClusterConfig) -> Self {
        RetryPolicy {
            max_attempts: config.connect_attempts.max(1),
            initial_wait: config.backoff_initial(),
            max_wait: config.backoff_max(),
        }
    }

    /// Policy used for retryable object and pool operations.
    pub fn for_ops(config: &ClusterConfig) -> Self {
        RetryPolicy {
            max_attempts: config.op_attempts.max(1),
            initial_wait: config.backoff_initial(),
            max_wait: config.backoff_max(),
        }
    }

    /// Starts a fresh back-off sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current_wait: self.initial_wait,
            failures: 0,
        }
    }
}

/// Tracks back-off state for one sequence of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current_wait: Duration,
    failures: u32,
}

impl Backoff {
    /// Records a failed attempt and returns the wait before the next one.
    ///
    /// Returns `None` once `max_attempts` attempts have failed. Each wait
    /// doubles the previous one, capped at `max_wait`.
    pub fn next_wait(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }
        let wait = self.current_wait;
        self.current_wait = self
            .current_wait
            .checked_mul(2)
            .unwrap_or(self.policy.max_wait)
            .min(self.policy.max_wait);
        Some(wait)
    }

    /// Number of failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
