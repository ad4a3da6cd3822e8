//! Device agent control loop.
//!
//! Single threaded. Every tick feeds the watchdog and then performs at most one
//! of: registration, telemetry submission, sampling, OTA check-in (in that
//! priority order). Network calls block within the tick.

use std::time::Duration;

use anyhow::Result;
use common::req::{Reading, RegisterRequest, SubmitReadingsRequest};
use heapless::Deque;
use log::{error, info, warn};

use crate::{
    boot::{BootRecord, BootResult, BootState, BootStore, Image, Partitions},
    client::{ApiClient, ClientError, Http},
    clock::Clock,
    config::{ConfigStore, DeviceConfig},
    ota::{OtaClient, OtaState, Outcome},
    retry::{Backoff, Next},
    sensor::{heartbeat, Sensor},
    watchdog::Watchdog,
};

pub const TICK: Duration = Duration::from_millis(100);
pub const QUEUE_LEN: usize = 16;
/// Successful submissions after a healthy boot before a candidate becomes stable.
pub const CONFIRM_AFTER: u32 = 1;

/// Platform services the agent runs on.
pub trait Platform {
    type Http: Http;
    type Config: ConfigStore;
    type Flash: Partitions + BootStore;
    type Clock: Clock;
    type Watchdog: Watchdog;
}

pub struct Parts<P: Platform> {
    pub http: P::Http,
    pub config: P::Config,
    pub flash: P::Flash,
    pub clock: P::Clock,
    pub watchdog: P::Watchdog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    UpdateStaged(String),
    LinkDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Registered,
    RegisterFailed(ClientError),
    Submitted(usize),
    SubmitFailed(ClientError),
    Sampled(usize),
    Checked(Outcome),
    Restart(RestartReason),
}

/// Why telemetry stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    CredentialRejected,
    RegistrationConflict,
}

pub struct Agent<P: Platform> {
    config: DeviceConfig,
    store: P::Config,
    api: ApiClient<P::Http>,
    flash: P::Flash,
    clock: P::Clock,
    watchdog: P::Watchdog,
    sensor: Option<Box<dyn Sensor>>,
    mac_address: Option<String>,

    boot: BootRecord,
    ota: OtaClient,
    queue: Deque<Reading, QUEUE_LEN>,
    registration: Backoff,
    telemetry: Backoff,
    halted: Option<Halt>,
    next_sample: Duration, // uptime
    clock_synced: bool,
    submissions: u32, // since boot
}

impl<P: Platform> Agent<P> {
    /// Loads the persisted configuration (or `defaults`) and reconciles the boot record
    /// with the running slot.
    pub fn new(
        mut parts: Parts<P>,
        defaults: DeviceConfig,
        firmware_version: &str,
        sensor: Option<Box<dyn Sensor>>,
        mac_address: Option<String>,
    ) -> Result<Self> {
        let config = match parts.config.load() {
            Ok(Some(config)) => config,
            Ok(None) => defaults,
            Err(e) => {
                error!("Stored configuration unreadable, using defaults: {e:#}");
                defaults
            }
        };

        let running = parts.flash.running();
        let stored = parts.flash.load_boot()?;
        let mut boot = stored
            .clone()
            .unwrap_or_else(|| {
                BootRecord::stable(Image {
                    slot: running,
                    version: firmware_version.to_owned(),
                })
            })
            .reconcile(running);

        let adopt = matches!(
            &boot.state,
            BootState::Stable(image) if image.slot != running || image.version != firmware_version
        );
        if adopt {
            // flashed by other means
            info!("Adopting running image {firmware_version} in slot {running:?}");
            boot = BootRecord {
                state: BootState::Stable(Image {
                    slot: running,
                    version: firmware_version.to_owned(),
                }),
                rolled_back_from: boot.rolled_back_from,
                blocked_version: boot.blocked_version,
            };
        } else if boot.is_candidate() {
            info!("Booted candidate {}, awaiting confirmation", boot.current().version);
            boot = boot.on_boot_result(BootResult::Healthy);
        }
        if stored.as_ref() != Some(&boot) {
            parts.flash.store_boot(&boot)?;
        }

        let ota = OtaClient::new(&boot);
        let api = ApiClient::new(parts.http, &config.server_url);
        parts.watchdog.set_enabled(true);

        info!(
            "Agent {} running {} (registered: {})",
            config.device_id,
            boot.current().version,
            config.is_registered()
        );

        Ok(Self {
            config,
            store: parts.config,
            api,
            flash: parts.flash,
            clock: parts.clock,
            watchdog: parts.watchdog,
            sensor,
            mac_address,
            boot,
            ota,
            queue: Deque::new(),
            registration: Backoff::new(),
            telemetry: Backoff::new(),
            halted: None,
            next_sample: Duration::ZERO,
            clock_synced: false,
            submissions: 0,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn boot(&self) -> &BootRecord {
        &self.boot
    }

    pub fn ota_state(&self) -> OtaState {
        self.ota.state()
    }

    pub fn halted(&self) -> Option<Halt> {
        self.halted
    }

    pub fn queued(&self) -> impl Iterator<Item = &Reading> {
        self.queue.iter()
    }

    pub fn into_parts(self) -> Parts<P> {
        Parts {
            http: self.api.into_http(),
            config: self.store,
            flash: self.flash,
            clock: self.clock,
            watchdog: self.watchdog,
        }
    }

    /// Runs until a restart is needed.
    pub fn run(&mut self) -> RestartReason {
        loop {
            if let Tick::Restart(reason) = self.tick() {
                warn!("Restart requested: {reason:?}");
                return reason;
            }
            std::thread::sleep(TICK);
        }
    }

    pub fn tick(&mut self) -> Tick {
        self.watchdog.feed();
        let now = self.clock.uptime();

        if self.halted.is_none() {
            if !self.config.is_registered() {
                if self.registration.is_ready(now) {
                    return self.register(now);
                }
            } else if !self.queue.is_empty() && self.telemetry.is_ready(now) {
                return self.submit(now);
            }
        }

        if now >= self.next_sample {
            return self.sample(now);
        }

        if self.config.is_registered() && self.ota.is_due(now) {
            return self.check_update();
        }

        Tick::Idle
    }

    fn register(&mut self, now: Duration) -> Tick {
        self.registration.begin();
        let req = RegisterRequest {
            device_id: self.config.device_id.clone(),
            firmware_version: self.boot.current().version.clone(),
            mac_address: self.mac_address.clone(),
        };

        match self.api.register(&req) {
            Ok(res) => {
                info!("Registered as {}", self.config.device_id);
                self.registration.on_success(now);
                self.config.credential = Some(res.credential);
                if res.reading_interval > 0 {
                    self.config.reading_interval = res.reading_interval;
                }
                self.sync_clock(res.server_time);
                if let Err(e) = self.store.save(&self.config) {
                    error!("Cannot persist configuration: {e:#}");
                }
                Tick::Registered
            }
            Err(ClientError::Conflict(msg)) => {
                error!("Registration refused ({msg}), needs re-provisioning");
                self.registration.on_success(now);
                self.halted = Some(Halt::RegistrationConflict);
                Tick::RegisterFailed(ClientError::Conflict(msg))
            }
            Err(ClientError::RateLimited(wait)) => {
                self.registration.defer(now, wait);
                Tick::RegisterFailed(ClientError::RateLimited(wait))
            }
            Err(e) => {
                warn!("Registration failed: {e}");
                match self.registration.on_failure(now) {
                    Next::Restart => Tick::Restart(RestartReason::LinkDown),
                    Next::RetryAt(_) => Tick::RegisterFailed(e),
                }
            }
        }
    }

    fn submit(&mut self, now: Duration) -> Tick {
        let Some(credential) = self.config.credential.clone() else {
            return Tick::Idle;
        };

        self.telemetry.begin();
        let req = SubmitReadingsRequest {
            device_id: self.config.device_id.clone(),
            credential,
            firmware_version: Some(self.boot.current().version.clone()),
            readings: self.queue.iter().cloned().collect(),
        };

        match self.api.submit(&req) {
            Ok(res) => {
                self.queue.clear();
                self.telemetry.on_success(now);
                if !res.rejected.is_empty() {
                    warn!("Gateway rejected {} reading(s): {:?}", res.rejected.len(), res.rejected);
                }
                if let Some(server_time) = res.server_time {
                    self.sync_clock(server_time);
                }
                if let Some(interval) = res.reading_interval {
                    if interval > 0 && interval != self.config.reading_interval {
                        info!("Reading interval changed to {interval} s");
                        self.config.reading_interval = interval;
                    }
                }

                self.submissions += 1;
                self.confirm_update();
                Tick::Submitted(res.received)
            }
            Err(ClientError::PendingApproval) => {
                info!("Waiting for operator approval");
                self.telemetry.defer(now, self.reading_interval());
                Tick::SubmitFailed(ClientError::PendingApproval)
            }
            Err(ClientError::RateLimited(wait)) => {
                warn!("Rate limited, next submission in {wait:?}");
                self.telemetry.defer(now, wait);
                Tick::SubmitFailed(ClientError::RateLimited(wait))
            }
            Err(ClientError::Auth) => {
                error!("Credential rejected, telemetry stopped until re-provisioned");
                self.halted = Some(Halt::CredentialRejected);
                Tick::SubmitFailed(ClientError::Auth)
            }
            Err(ClientError::Validation(msg)) => {
                warn!("Batch of {} rejected ({msg}), dropping it", self.queue.len());
                self.queue.clear();
                self.telemetry.defer(now, Duration::ZERO);
                Tick::SubmitFailed(ClientError::Validation(msg))
            }
            Err(e) => {
                warn!("Submission failed: {e}");
                match self.telemetry.on_failure(now) {
                    Next::Restart => Tick::Restart(RestartReason::LinkDown),
                    Next::RetryAt(_) => Tick::SubmitFailed(e),
                }
            }
        }
    }

    fn sample(&mut self, now: Duration) -> Tick {
        self.next_sample = now + self.reading_interval();
        let timestamp = self.clock_synced.then(|| self.clock.unix_time());

        let readings = match &mut self.sensor {
            Some(sensor) => match sensor.sample(timestamp) {
                Ok(readings) => readings,
                Err(e) => {
                    warn!("Sensor read failed: {e:#}");
                    return Tick::Sampled(0);
                }
            },
            None => vec![heartbeat(timestamp)],
        };

        let n = readings.len();
        for reading in readings {
            if let Err(reading) = self.queue.push_back(reading) {
                if let Some(dropped) = self.queue.pop_front() {
                    warn!("Reading queue full, dropped {} reading", dropped.sensor);
                }
                let _ = self.queue.push_back(reading);
            }
        }
        Tick::Sampled(n)
    }

    fn check_update(&mut self) -> Tick {
        let outcome = self.ota.run(
            &mut self.api,
            &mut self.flash,
            &self.clock,
            &mut self.watchdog,
            &mut self.boot,
            &self.config.device_id,
        );
        match outcome {
            Outcome::Staged(version) => Tick::Restart(RestartReason::UpdateStaged(version)),
            outcome => Tick::Checked(outcome),
        }
    }

    /// A candidate that booted and delivered telemetry becomes the stable image.
    fn confirm_update(&mut self) {
        if !self.boot.is_candidate() || self.submissions < CONFIRM_AFTER {
            return;
        }

        let confirmed = match self.boot.clone().confirm() {
            Ok(record) => record,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        if let Err(e) = self.flash.mark_running_valid() {
            error!("Cannot mark running image valid: {e:#}");
            return;
        }
        if let Err(e) = self.flash.store_boot(&confirmed) {
            error!("Cannot persist boot record: {e:#}");
            return;
        }

        self.boot = confirmed;
        self.ota.on_confirmed();
        info!("Update to {} confirmed", self.boot.current().version);
        if let Err(e) = self.store.save(&self.config) {
            error!("Cannot persist configuration: {e:#}");
        }
    }

    fn sync_clock(&mut self, server_time: i64) {
        let skew = server_time - self.clock.unix_time();
        if self.clock_synced && skew == 0 {
            return;
        }
        info!("Clock set from server ({skew:+} s)");
        self.clock.set_unix_time(server_time);
        self.clock_synced = true;
    }

    fn reading_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.reading_interval.max(1)))
    }
}
