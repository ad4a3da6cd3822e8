use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock {
    /// Monotonic time since boot. Drives every schedule of the agent.
    fn uptime(&self) -> Duration;

    /// Wall clock in unix seconds. Untrusted until corrected by the gateway.
    fn unix_time(&self) -> i64;

    fn set_unix_time(&mut self, secs: i64);
}

/// `std` clock, also used on target (ESP-IDF provides `std::time`).
#[derive(Debug)]
pub struct SystemClock {
    boot: Instant,
    offset: i64, // s, server time - local time
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            offset: 0,
        }
    }

    fn local_time() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn uptime(&self) -> Duration {
        self.boot.elapsed()
    }

    fn unix_time(&self) -> i64 {
        Self::local_time() + self.offset
    }

    fn set_unix_time(&mut self, secs: i64) {
        self.offset = secs - Self::local_time();
    }
}
