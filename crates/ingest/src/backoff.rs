use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Exponential backoff with a small clock-derived jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay_ms: u64,
    max_delay_ms: u64,
    factor: f64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            delay_ms: initial_ms.max(1),
            max_delay_ms: max_delay_ms.max(initial_ms),
            factor: 2.0,
        }
    }

    /// Delay to sleep before the next attempt; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let sleep_ms = self.delay_ms + jitter_ms();
        self.delay_ms = ((self.delay_ms as f64 * self.factor) as u64).min(self.max_delay_ms);
        Duration::from_millis(sleep_ms)
    }
}

/// Jitter without rand: nanosecond fraction of the current time, in `[0, 100)`.
fn jitter_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
        % 100
}
