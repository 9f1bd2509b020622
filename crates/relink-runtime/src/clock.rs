use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Wall-clock milliseconds derived from tokio's monotonic clock.
///
/// Anchored to the Unix time observed at construction so timestamps stay
/// meaningful on disk, while advancing with `tokio::time` so paused-time
/// tests see consistent values.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    epoch_ms: u64,
    origin: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);
        Self::anchored_at(epoch_ms)
    }

    pub fn anchored_at(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms
            .saturating_add(self.origin.elapsed().as_millis() as u64)
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}
