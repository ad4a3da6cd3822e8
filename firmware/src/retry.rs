//! Failure ladder shared by registration and telemetry.
//!
//! `IDLE -> SENDING -> {SUCCESS, FAILED}`. A failure schedules the next attempt
//! immediately, then after 30 s, then every 5 minutes. Failing continuously for
//! a day asks for a full restart.

use std::time::Duration;

use log::{error, warn};

pub const LADDER: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
];
pub const RESTART_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    RetryAt(Duration), // uptime
    Restart,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    state: SendState,
    failures: u32,
    failing_since: Option<Duration>,
    next_attempt: Duration, // uptime
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            state: SendState::Idle,
            failures: 0,
            failing_since: None,
            next_attempt: Duration::ZERO,
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_ready(&self, now: Duration) -> bool {
        self.state != SendState::Sending && now >= self.next_attempt
    }

    pub fn begin(&mut self) {
        self.state = SendState::Sending;
    }

    pub fn on_success(&mut self, now: Duration) {
        self.state = SendState::Success;
        self.failures = 0;
        self.failing_since = None;
        self.next_attempt = now;
    }

    /// The gateway answered but asks to wait (pending approval, rate limit).
    /// The link works, so the ladder starts over.
    pub fn defer(&mut self, now: Duration, wait: Duration) {
        self.state = SendState::Idle;
        self.failures = 0;
        self.failing_since = None;
        self.next_attempt = now + wait;
    }

    pub fn on_failure(&mut self, now: Duration) -> Next {
        self.state = SendState::Failed;
        let since = *self.failing_since.get_or_insert(now);
        if now.saturating_sub(since) >= RESTART_AFTER {
            error!("Failing for {:?}, restart required", now - since);
            return Next::Restart;
        }

        let delay = LADDER[(self.failures as usize).min(LADDER.len() - 1)];
        self.failures += 1;
        self.next_attempt = now + delay;
        warn!("Attempt {} failed, next in {:?}", self.failures, delay);
        Next::RetryAt(self.next_attempt)
    }
}
