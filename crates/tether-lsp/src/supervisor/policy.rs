//! Restart policy and the attempt budget it governs.

use std::time::Duration;

use tether_config::{Config, RestartMode};

/// Decides whether and when a crashed server is restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Whether unexpected exits trigger restarts at all.
    pub mode: RestartMode,
    /// Restart attempts allowed before the server is declared unavailable.
    pub max_attempts: u32,
    /// Delay before each attempt: entry `n` precedes attempt `n + 1`, the
    /// last entry repeats, and an empty list means no delay.
    pub backoff: Vec<Duration>,
    /// Uptime after which a crash starts a fresh budget; `None` never
    /// resets.
    pub reset_after: Option<Duration>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::OnUnexpectedExit,
            max_attempts: 4,
            backoff: [100, 500, 1000, 2000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            reset_after: Some(Duration::from_secs(180)),
        }
    }
}

impl RestartPolicy {
    /// A policy that never restarts.
    #[must_use]
    pub fn never() -> Self {
        Self {
            mode: RestartMode::Never,
            ..Self::default()
        }
    }

    /// Builds the policy from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.restart_mode,
            max_attempts: config.restart_max_attempts,
            backoff: config.restart_backoff(),
            reset_after: config.restart_reset_after(),
        }
    }

    /// Returns the delay preceding `attempt`, counted from one.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Attempts consumed since the budget was last reset.
#[derive(Debug, Default)]
pub(crate) struct RestartBudget {
    attempts: u32,
}

impl RestartBudget {
    /// Records a crash after `uptime`, resetting the budget when the server
    /// had stayed up long enough.
    pub(crate) fn record_crash(&mut self, policy: &RestartPolicy, uptime: Duration) {
        if policy.reset_after.is_some_and(|threshold| uptime >= threshold) {
            self.attempts = 0;
        }
    }

    /// Consumes the next attempt, or returns `None` when none remain.
    pub(crate) fn next_attempt(&mut self, policy: &RestartPolicy) -> Option<u32> {
        if policy.mode == RestartMode::Never || self.attempts >= policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) const fn attempts(&self) -> u32 {
        self.attempts
    }
}
