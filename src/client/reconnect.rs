//! Reconnect Controller
//!
//! Backoff bookkeeping for the automatic reconnect loop of a client
//! session. The controller is pure state; the session drives the timers
//! and socket attempts and consults it between attempts.

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectConfig,
    current_backoff: Duration,
    attempts_made: u32,
    active: bool,
}

impl ReconnectController {
    pub fn new(policy: ReconnectConfig) -> Self {
        let current_backoff = policy.initial_backoff;
        Self {
            policy,
            current_backoff,
            attempts_made: 0,
            active: false,
        }
    }

    /// Mark the controller active. Returns false if a loop is already running.
    pub fn try_start(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    /// Delay to wait before the next attempt, or `None` once retries are exhausted.
    ///
    /// Exhaustion deactivates the controller.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        if !self.active {
            return None;
        }

        if !self.policy.is_unlimited() && i64::from(self.attempts_made) >= self.policy.max_retries {
            self.active = false;
            return None;
        }

        self.attempts_made = self.attempts_made.saturating_add(1);
        Some(self.current_backoff)
    }

    /// Double the backoff after a failed attempt, capped at the maximum
    pub fn record_failure(&mut self) {
        self.current_backoff = self
            .current_backoff
            .saturating_mul(2)
            .min(self.policy.max_backoff);
    }

    /// Back to the initial state after a successful reconnect or an explicit call
    pub fn reset(&mut self) {
        self.current_backoff = self.policy.initial_backoff;
        self.attempts_made = 0;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn policy(&self) -> &ReconnectConfig {
        &self.policy
    }
}
