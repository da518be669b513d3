use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Linear backoff: `base + occurrences * step`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    step_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, step_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            step_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn step_ms(&self) -> u64 {
        self.step_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_occurrences(&self, occurrences: usize) -> Duration {
        let occurrences = u64::try_from(occurrences).unwrap_or(u64::MAX);
        let calculated = self
            .base_delay_ms
            .saturating_add(self.step_ms.saturating_mul(occurrences));
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let settings = ReconnectSettings::default();
        settings.restart_policy()
    }
}

/// Reconnect tuning shared by the loop guard and the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Base delay before retrying a restart-required closure.
    pub restart_base_delay_ms: u64,
    /// Added per restart-required occurrence inside the loop window.
    pub restart_delay_step_ms: u64,
    /// Upper bound for restart-required delays.
    pub restart_max_delay_ms: u64,
    /// Flat delay before retrying an unclassified closure.
    pub unknown_retry_delay_ms: u64,
    /// Width of the trailing loop-detection window.
    pub loop_window_ms: u64,
    /// Restart-required retries tolerated inside one window.
    pub loop_threshold: usize,
}

impl ReconnectSettings {
    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.restart_base_delay_ms,
            self.restart_delay_step_ms,
            self.restart_max_delay_ms,
        )
    }

    pub fn unknown_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unknown_retry_delay_ms)
    }

    pub fn loop_window(&self) -> Duration {
        Duration::from_millis(self.loop_window_ms)
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            restart_base_delay_ms: 1_500,
            restart_delay_step_ms: 500,
            restart_max_delay_ms: 10_000,
            unknown_retry_delay_ms: 5_000,
            loop_window_ms: 60_000,
            loop_threshold: 6,
        }
    }
}
