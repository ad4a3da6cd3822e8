use log::{info, warn};

/// Task watchdog. Restarts the device when an agent iteration does not feed it in time.
pub trait Watchdog {
    fn feed(&mut self);
    fn set_enabled(&mut self, enabled: bool);
}

/// Keeps the watchdog disabled while alive (OTA download window).
pub struct WatchdogPause<'a, W: Watchdog> {
    watchdog: &'a mut W,
}

impl<'a, W: Watchdog> WatchdogPause<'a, W> {
    pub fn new(watchdog: &'a mut W) -> Self {
        warn!("Watchdog paused");
        watchdog.set_enabled(false);
        Self { watchdog }
    }
}

impl<W: Watchdog> Drop for WatchdogPause<'_, W> {
    fn drop(&mut self) {
        self.watchdog.set_enabled(true);
        self.watchdog.feed();
        info!("Watchdog resumed");
    }
}
