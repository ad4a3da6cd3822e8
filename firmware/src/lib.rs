//! Device agent: registration, telemetry and OTA updates against the gateway.
//!
//! Everything outside of [`esp`] is platform independent and runs on the host
//! with the fakes in the test modules.

pub mod agent;
pub mod boot;
pub mod client;
pub mod clock;
pub mod config;
pub mod ota;
pub mod retry;
pub mod sensor;
pub mod watchdog;

#[cfg(feature = "esp")]
pub mod esp;

#[cfg(test)]
mod testing;

pub use agent::{Agent, Platform, RestartReason, Tick};
