use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Time source injected into the controller and the hub.
pub trait Clock: Send + Sync {
    /// Monotonic instant used for loop-window arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since Unix epoch used for log and projection timestamps.
    fn unix_millis(&self) -> u64;
}

/// Production clock.
///
/// Monotonic time comes from tokio so paused-time tests stay consistent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    origin_unix_ms: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(origin_unix_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_unix_ms,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_731_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn unix_millis(&self) -> u64 {
        let offset_ms = self.offset().as_millis().min(u128::from(u64::MAX)) as u64;
        self.origin_unix_ms.saturating_add(offset_ms)
    }
}
