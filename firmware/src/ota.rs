//! OTA client.
//!
//! ```text
//! CHECKING -> NO_UPDATE | UPDATE_AVAILABLE
//! UPDATE_AVAILABLE -> DOWNLOADING
//! DOWNLOADING -> VERIFYING | ABORTED
//! VERIFYING -> SWAP_PENDING | ABORTED
//! SWAP_PENDING -> REBOOTING
//! REBOOTING -> CONFIRMED | ROLLED_BACK
//! ```
//!
//! The download is pulled chunk by chunk; every [`DownloadSession::poll`]
//! returns `(bytes_downloaded, total)` so the loop driving it stays linear.
//! The whole download runs inside one agent tick with the watchdog paused, so
//! progress is polled once per chunk, not once per agent tick.
//!
//! A version whose image was bad (checksum or size) or that rolled back is
//! remembered in the boot record and skipped until the server offers another
//! one. Timeouts and storage errors only get reported; the next check retries.

use std::time::Duration;

use common::{
    req::{UpdateCheckQuery, UpdateCheckResponse},
    Version,
};
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};

use crate::{
    boot::{BootRecord, BootStore, Image, Partitions},
    client::{ApiClient, ClientError, Http},
    clock::Clock,
    watchdog::{Watchdog, WatchdogPause},
};

pub const FIRST_CHECK: Duration = Duration::from_secs(60); // after boot
pub const CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
pub const CHECK_RETRY: Duration = Duration::from_secs(5 * 60);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    SwapPending,
    Rebooting,
    Confirmed,
    RolledBack,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtaError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("flash: {0}")]
    Storage(String),
    #[error("invalid update offer: {0}")]
    InvalidOffer(String),
}

impl OtaError {
    /// The image itself is at fault, so fetching it again cannot help.
    pub fn condemns_image(&self) -> bool {
        matches!(
            self,
            OtaError::ChecksumMismatch { .. } | OtaError::SizeMismatch { .. }
        )
    }
}

impl From<ClientError> for OtaError {
    fn from(err: ClientError) -> Self {
        Self::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub version: String,
    pub url: String,
    pub size: u64,
    pub checksum: String,
}

impl Offer {
    fn from_response(res: UpdateCheckResponse) -> Result<Option<Self>, OtaError> {
        if !res.update_available {
            return Ok(None);
        }

        let missing = |field| OtaError::InvalidOffer(format!("{field} missing"));
        let offer = Self {
            version: res.version.ok_or_else(|| missing("version"))?,
            url: res.url.ok_or_else(|| missing("url"))?,
            size: res.size.ok_or_else(|| missing("size"))?,
            checksum: res.checksum.ok_or_else(|| missing("checksum"))?.to_lowercase(),
        };
        if offer.size == 0 {
            return Err(OtaError::InvalidOffer("empty image".into()));
        }
        Ok(Some(offer))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_downloaded: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Receiving(Progress),
    Complete(Progress),
}

/// Streams one image into the inactive slot.
pub struct DownloadSession {
    offer: Offer,
    hasher: Sha256,
    bytes_downloaded: u64,
    deadline: Duration, // uptime
    buf: [u8; CHUNK_SIZE],
}

impl DownloadSession {
    pub fn start<H: Http, P: Partitions>(
        api: &mut ApiClient<H>,
        flash: &mut P,
        offer: Offer,
        now: Duration,
    ) -> Result<Self, OtaError> {
        let announced = api.open_download(&offer.url)?;
        if let Some(len) = announced {
            if len != offer.size {
                api.close_download();
                return Err(OtaError::SizeMismatch {
                    expected: offer.size,
                    actual: len,
                });
            }
        }

        if let Err(e) = flash.begin(offer.size) {
            api.close_download();
            return Err(OtaError::Storage(format!("{e:#}")));
        }

        Ok(Self {
            offer,
            hasher: Sha256::new(),
            bytes_downloaded: 0,
            deadline: now + DOWNLOAD_TIMEOUT,
            buf: [0; CHUNK_SIZE],
        })
    }

    pub fn progress(&self) -> Progress {
        Progress {
            bytes_downloaded: self.bytes_downloaded,
            total: self.offer.size,
        }
    }

    /// Moves at most one chunk from the connection into flash.
    pub fn poll<H: Http, P: Partitions>(
        &mut self,
        api: &mut ApiClient<H>,
        flash: &mut P,
        now: Duration,
    ) -> Result<Step, OtaError> {
        if now > self.deadline {
            return Err(OtaError::Timeout(DOWNLOAD_TIMEOUT));
        }

        let n = api.read_download(&mut self.buf)?;
        if n == 0 {
            return Ok(Step::Complete(self.progress()));
        }

        let chunk = &self.buf[..n];
        self.bytes_downloaded += n as u64;
        if self.bytes_downloaded > self.offer.size {
            return Err(OtaError::SizeMismatch {
                expected: self.offer.size,
                actual: self.bytes_downloaded,
            });
        }
        self.hasher.update(chunk);
        flash
            .write(chunk)
            .map_err(|e| OtaError::Storage(format!("{e:#}")))?;

        Ok(Step::Receiving(self.progress()))
    }

    /// Size and SHA-256 of what was written against the declared values.
    pub fn verify(self) -> Result<Offer, OtaError> {
        if self.bytes_downloaded != self.offer.size {
            return Err(OtaError::SizeMismatch {
                expected: self.offer.size,
                actual: self.bytes_downloaded,
            });
        }

        let actual = hex::encode(self.hasher.finalize());
        if actual != self.offer.checksum {
            return Err(OtaError::ChecksumMismatch {
                expected: self.offer.checksum,
                actual,
            });
        }
        Ok(self.offer)
    }
}

/// Outcome of the previous attempt, carried on the next check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub failed_version: String,
    pub error: Option<String>,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NoUpdate,
    /// Candidate verified and set as boot target, restart to try it.
    Staged(String),
    Aborted(OtaError),
    CheckFailed(ClientError),
}

pub struct OtaClient {
    state: OtaState,
    next_check: Duration, // uptime
    blocked: Option<String>, // mirrors `BootRecord::blocked_version`
    report: Option<Report>,
}

impl OtaClient {
    pub fn new(boot: &BootRecord) -> Self {
        let mut ota = Self {
            state: OtaState::Idle,
            next_check: FIRST_CHECK,
            blocked: boot.blocked_version.clone(),
            report: None,
        };

        if let Some(version) = &boot.rolled_back_from {
            error!(
                "Running {} after rollback from {version}",
                boot.current().version
            );
            ota.state = OtaState::RolledBack;
            ota.report = Some(Report {
                failed_version: version.clone(),
                error: Some("boot failed, rolled back".into()),
                rolled_back: true,
            });
        } else if boot.is_candidate() {
            ota.state = OtaState::Rebooting;
        }
        ota
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.next_check
    }

    pub fn on_confirmed(&mut self) {
        self.state = OtaState::Confirmed;
    }

    pub fn query(&self, device_id: &str, version: &str) -> UpdateCheckQuery {
        let mut query = UpdateCheckQuery {
            device_id: device_id.to_owned(),
            version: version.to_owned(),
            ..Default::default()
        };
        if let Some(report) = &self.report {
            query.rolled_back = report.rolled_back.then_some(true);
            query.failed_version = Some(report.failed_version.clone());
            query.error = report.error.clone();
        }
        query
    }

    /// One full check-in; downloads, verifies and stages an update if one is offered.
    pub fn run<H, F, K, W>(
        &mut self,
        api: &mut ApiClient<H>,
        flash: &mut F,
        clock: &K,
        watchdog: &mut W,
        boot: &mut BootRecord,
        device_id: &str,
    ) -> Outcome
    where
        H: Http,
        F: Partitions + BootStore,
        K: Clock,
        W: Watchdog,
    {
        self.state = OtaState::Checking;
        let running = boot.current().version.clone();
        let query = self.query(device_id, &running);
        let res = match api.check_update(&query) {
            Ok(res) => res,
            Err(e) => {
                warn!("OTA check failed: {e}");
                self.state = OtaState::Idle;
                self.next_check = clock.uptime() + CHECK_RETRY;
                return Outcome::CheckFailed(e);
            }
        };
        self.next_check = clock.uptime() + CHECK_INTERVAL;

        if self.report.take().is_some() {
            info!("Previous update outcome reported");
        }
        if boot.rolled_back_from.take().is_some() {
            if let Err(e) = flash.store_boot(boot) {
                warn!("Cannot persist boot record: {e:#}");
            }
        }

        let offer = match Offer::from_response(res) {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                debug!("No update, running {running}");
                self.state = OtaState::NoUpdate;
                return Outcome::NoUpdate;
            }
            Err(e) => {
                warn!("{e}");
                self.state = OtaState::NoUpdate;
                return Outcome::NoUpdate;
            }
        };

        if Version::parse_lossy(&offer.version) <= Version::parse_lossy(&running) {
            debug!("Ignoring offer {}, running {running}", offer.version);
            self.state = OtaState::NoUpdate;
            return Outcome::NoUpdate;
        }
        if self.blocked.as_deref() == Some(offer.version.as_str()) {
            info!("Skipping {}, it failed before", offer.version);
            self.state = OtaState::NoUpdate;
            return Outcome::NoUpdate;
        }
        if boot.is_candidate() {
            debug!("Update {} deferred, {running} is unconfirmed", offer.version);
            self.state = OtaState::NoUpdate;
            return Outcome::NoUpdate;
        }

        info!(
            "Update available: {running} -> {} ({} bytes)",
            offer.version, offer.size
        );
        self.state = OtaState::UpdateAvailable;

        let version = offer.version.clone();
        match self.download(api, flash, clock, watchdog, offer) {
            Ok(offer) => self.swap(flash, boot, offer),
            Err(e) => self.abort(flash, boot, &version, e),
        }
    }

    fn download<H, P, K, W>(
        &mut self,
        api: &mut ApiClient<H>,
        flash: &mut P,
        clock: &K,
        watchdog: &mut W,
        offer: Offer,
    ) -> Result<Offer, OtaError>
    where
        H: Http,
        P: Partitions,
        K: Clock,
        W: Watchdog,
    {
        let _pause = WatchdogPause::new(watchdog);

        self.state = OtaState::Downloading;
        let mut session = DownloadSession::start(api, flash, offer, clock.uptime())?;
        let mut last_logged = 0;
        let progress = loop {
            match session.poll(api, flash, clock.uptime()) {
                Ok(Step::Receiving(p)) => {
                    if p.bytes_downloaded - last_logged >= 64 * 1024 {
                        info!("Downloading: {}/{} bytes", p.bytes_downloaded, p.total);
                        last_logged = p.bytes_downloaded;
                    }
                }
                Ok(Step::Complete(p)) => break p,
                Err(e) => {
                    api.close_download();
                    flash.abort();
                    return Err(e);
                }
            }
        };
        api.close_download();
        info!("Downloaded {} bytes", progress.bytes_downloaded);

        self.state = OtaState::Verifying;
        let offer = match session.verify() {
            Ok(offer) => offer,
            Err(e) => {
                flash.abort();
                return Err(e);
            }
        };
        if let Err(e) = flash.finish() {
            flash.abort();
            return Err(OtaError::Storage(format!("{e:#}")));
        }
        Ok(offer)
    }

    fn swap<F: Partitions + BootStore>(
        &mut self,
        flash: &mut F,
        boot: &mut BootRecord,
        offer: Offer,
    ) -> Outcome {
        self.state = OtaState::SwapPending;
        let slot = flash.running().other();
        let staged = match boot.clone().stage(Image {
            slot,
            version: offer.version.clone(),
        }) {
            Ok(staged) => staged,
            Err(e) => {
                let err = OtaError::Storage(e.to_string());
                return self.abort(flash, boot, &offer.version, err);
            }
        };

        if let Err(e) = flash.store_boot(&staged) {
            let err = OtaError::Storage(format!("{e:#}"));
            return self.abort(flash, boot, &offer.version, err);
        }
        if let Err(e) = flash.set_boot(slot) {
            if let Err(e) = flash.store_boot(boot) {
                error!("Cannot restore boot record: {e:#}");
            }
            let err = OtaError::Storage(format!("{e:#}"));
            return self.abort(flash, boot, &offer.version, err);
        }

        *boot = staged;
        self.state = OtaState::Rebooting;
        info!("Update {} staged in slot {slot:?}, rebooting", offer.version);
        Outcome::Staged(offer.version)
    }

    fn abort<S: BootStore>(
        &mut self,
        store: &mut S,
        boot: &mut BootRecord,
        version: &str,
        err: OtaError,
    ) -> Outcome {
        error!("OTA update to {version} aborted: {err}");
        self.state = OtaState::Aborted;
        if err.condemns_image() {
            self.blocked = Some(version.to_owned());
            boot.blocked_version = Some(version.to_owned());
            if let Err(e) = store.store_boot(boot) {
                warn!("Cannot persist blocked version: {e:#}");
            }
        }
        self.report = Some(Report {
            failed_version: version.to_owned(),
            error: Some(err.to_string()),
            rolled_back: false,
        });
        Outcome::Aborted(err)
    }
}
