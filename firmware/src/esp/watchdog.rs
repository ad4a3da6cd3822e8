use std::ptr;

use esp_idf_sys::{esp, esp_task_wdt_add, esp_task_wdt_delete, esp_task_wdt_reset};
use log::error;

use crate::watchdog::Watchdog;

/// Subscribes the agent task to the task watchdog (timeout from sdkconfig).
pub struct TaskWatchdog {
    subscribed: bool,
}

impl TaskWatchdog {
    pub fn new() -> Self {
        Self { subscribed: false }
    }
}

impl Default for TaskWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog for TaskWatchdog {
    fn feed(&mut self) {
        if self.subscribed {
            unsafe { esp_task_wdt_reset() };
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.subscribed {
            return;
        }
        let res = if enabled {
            esp!(unsafe { esp_task_wdt_add(ptr::null_mut()) })
        } else {
            esp!(unsafe { esp_task_wdt_delete(ptr::null_mut()) })
        };
        match res {
            Ok(()) => self.subscribed = enabled,
            Err(e) => error!("Task watchdog: {e}"),
        }
    }
}
