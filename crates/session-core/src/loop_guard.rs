//! Reconnect loop detection for restart-required closures.
//!
//! The guard itself holds no clock and no state: callers pass the window and
//! the current instant, which keeps every decision reproducible in tests.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::retry::{ReconnectSettings, RetryPolicy};

/// Trailing timestamps of restart-required occurrences for one instance.
#[derive(Debug, Clone, Default)]
pub struct FailureWindow {
    occurrences: VecDeque<Instant>,
}

impl FailureWindow {
    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    pub fn clear(&mut self) {
        self.occurrences.clear();
    }

    /// Drop occurrences older than `width` relative to `now`.
    pub fn prune(&mut self, now: Instant, width: Duration) {
        while let Some(oldest) = self.occurrences.front() {
            if now.saturating_duration_since(*oldest) > width {
                self.occurrences.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, append `now`, and return the resulting count.
    pub fn record(&mut self, now: Instant, width: Duration) -> usize {
        self.prune(now, width);
        self.occurrences.push_back(now);
        self.occurrences.len()
    }
}

/// Outcome of one restart-required occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Retry after `delay`; `occurrences` counts this one.
    Retry { delay: Duration, occurrences: usize },
    /// Too many occurrences inside the window; stop retrying.
    LoopDetected { occurrences: usize },
}

impl GuardDecision {
    pub fn allows_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopGuard {
    window: Duration,
    threshold: usize,
    backoff: RetryPolicy,
}

impl LoopGuard {
    pub fn new(window: Duration, threshold: usize, backoff: RetryPolicy) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            backoff,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            settings.loop_window(),
            settings.loop_threshold,
            settings.restart_policy(),
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one occurrence at `now` and decide whether to retry.
    ///
    /// The first `threshold` occurrences inside the window are retried; the
    /// next one is denied. A denied window is left intact.
    pub fn record(&self, window: &mut FailureWindow, now: Instant) -> GuardDecision {
        let occurrences = window.record(now, self.window);
        self.decide(occurrences)
    }

    /// Pure decision for a given in-window occurrence count.
    pub fn decide(&self, occurrences: usize) -> GuardDecision {
        if occurrences > self.threshold {
            GuardDecision::LoopDetected { occurrences }
        } else {
            GuardDecision::Retry {
                delay: self.backoff.delay_for_occurrences(occurrences),
                occurrences,
            }
        }
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}
