//! ESP-IDF implementations of the platform traits.

pub mod aht20;
pub mod flash;
pub mod http;
pub mod nvs;
pub mod utils;
pub mod watchdog;
pub mod wifi;

use crate::{agent::Platform, clock::SystemClock};

pub struct Esp;

impl Platform for Esp {
    type Http = http::EspHttp;
    type Config = nvs::NvsConfigStore;
    type Flash = flash::EspFlash;
    type Clock = SystemClock;
    type Watchdog = watchdog::TaskWatchdog;
}
