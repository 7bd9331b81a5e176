use std::time::Duration;

/// Samples throughput once per fixed interval.
#[derive(Debug, Clone)]
pub struct RateMeter {
    interval_ms: u64,
    window_start_ms: u64,
    window_bytes: u64,
}

impl RateMeter {
    pub fn new(interval: Duration, now_ms: u64) -> Self {
        Self {
            interval_ms: (interval.as_millis() as u64).max(1),
            window_start_ms: now_ms,
            window_bytes: 0,
        }
    }

    /// Count `bytes`; returns bytes per second once the interval has elapsed.
    pub fn record(&mut self, bytes: u64, now_ms: u64) -> Option<u64> {
        self.window_bytes += bytes;
        let elapsed = now_ms.saturating_sub(self.window_start_ms);
        if elapsed < self.interval_ms {
            return None;
        }
        let rate = self.window_bytes * 1000 / elapsed;
        self.window_start_ms = now_ms;
        self.window_bytes = 0;
        Some(rate)
    }
}
