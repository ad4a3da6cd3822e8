//! In-memory stand-ins for the platform traits.

use std::{
    cell::Cell,
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use common::{
    req::{
        ErrorBody, Reading, RegisterRequest, RegisterResponse, SubmitReadingsRequest,
        SubmitReadingsResponse, UpdateCheckQuery, UpdateCheckResponse, STATUS_OK,
        STATUS_PENDING_APPROVAL,
    },
    Version,
};
use sha2::{Digest, Sha256};

use crate::{
    boot::{BootRecord, BootResult, BootStore, Image, Partitions, Slot, MAX_BOOT_ATTEMPTS},
    client::{Http, Method, Response},
    clock::Clock,
    watchdog::Watchdog,
};

pub fn image_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ===============================================
// clock & watchdog
// ===============================================

/// Shared manual time, clones observe the same clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
    unix_at_boot: Rc<Cell<i64>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Rc::new(Cell::new(Duration::ZERO)),
            unix_at_boot: Rc::new(Cell::new(0)),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn uptime(&self) -> Duration {
        self.now.get()
    }

    fn unix_time(&self) -> i64 {
        self.unix_at_boot.get() + self.now.get().as_secs() as i64
    }

    fn set_unix_time(&mut self, secs: i64) {
        self.unix_at_boot.set(secs - self.now.get().as_secs() as i64);
    }
}

#[derive(Debug, Default)]
pub struct FakeWatchdog {
    pub enabled: bool,
    pub feeds: usize,
    pub disabled_count: usize,
}

impl Watchdog for FakeWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled && !enabled {
            self.disabled_count += 1;
        }
        self.enabled = enabled;
    }
}

// ===============================================
// http
// ===============================================

/// Replays canned responses in order.
#[derive(Debug, Default)]
pub struct ScriptedHttp {
    responses: VecDeque<Response>,
    pub urls: Vec<String>,
}

impl ScriptedHttp {
    pub fn push(&mut self, status: u16, body: &str) {
        self.responses.push_back(Response {
            status,
            body: body.as_bytes().to_vec(),
        });
    }
}

impl Http for ScriptedHttp {
    fn request(&mut self, _method: Method, url: &str, _body: Option<&[u8]>) -> Result<Response> {
        self.urls.push(url.to_owned());
        self.responses
            .pop_front()
            .ok_or_else(|| anyhow!("connection refused"))
    }

    fn open(&mut self, _url: &str) -> Result<(u16, Option<u64>)> {
        bail!("connection refused")
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        bail!("connection refused")
    }

    fn close(&mut self) {}
}

/// Behaves like the gateway for one device.
pub struct FakeGateway {
    clock: ManualClock,
    pub down: bool,
    pub approved: bool,
    pub credential: String,
    pub register_status: Option<u16>,
    pub registrations: usize,
    pub rate_limit_once: Option<u64>, // s
    pub submits: usize,
    pub stored: Vec<Reading>,
    pub server_time: i64,
    pub reading_interval: u32,
    pub releases: Vec<(String, Vec<u8>, String)>, // version, image, declared checksum
    pub checks: Vec<UpdateCheckQuery>,
    pub last_offer: Option<UpdateCheckResponse>,
    pub truncate_download: Option<usize>,
    pub read_delay: Duration,
    pub downloads: usize,
    download: Option<(Vec<u8>, usize)>,
}

impl FakeGateway {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            down: false,
            approved: true,
            credential: "K1".into(),
            register_status: None,
            registrations: 0,
            rate_limit_once: None,
            submits: 0,
            stored: Vec::new(),
            server_time: 1_700_000_000,
            reading_interval: 60,
            releases: Vec::new(),
            checks: Vec::new(),
            last_offer: None,
            truncate_download: None,
            read_delay: Duration::ZERO,
            downloads: 0,
            download: None,
        }
    }

    /// Publishes a release. `checksum` overrides the correct one.
    pub fn release(&mut self, version: &str, image: Vec<u8>, checksum: Option<String>) {
        let checksum = checksum.unwrap_or_else(|| image_checksum(&image));
        self.releases.push((version.into(), image, checksum));
    }

    fn json<T: serde::Serialize>(status: u16, body: &T) -> Result<Response> {
        Ok(Response {
            status,
            body: serde_json::to_vec(body)?,
        })
    }

    fn error(status: u16, message: &str) -> Result<Response> {
        Self::json(
            status,
            &ErrorBody {
                message: message.into(),
                status: None,
                retry_after: None,
                rejected: Vec::new(),
            },
        )
    }

    fn path(url: &str) -> (&str, &str) {
        let url = url.strip_prefix("http://gw").unwrap_or(url);
        url.split_once('?').unwrap_or((url, ""))
    }

    fn register(&mut self, body: &[u8]) -> Result<Response> {
        let _req: RegisterRequest = serde_json::from_slice(body)?;
        if let Some(status) = self.register_status {
            return Self::error(status, "device already registered");
        }
        self.registrations += 1;
        Self::json(
            200,
            &RegisterResponse {
                credential: self.credential.clone(),
                server_time: self.server_time,
                reading_interval: self.reading_interval,
            },
        )
    }

    fn submit(&mut self, body: &[u8]) -> Result<Response> {
        let req: SubmitReadingsRequest = serde_json::from_slice(body)?;
        self.submits += 1;
        if req.credential != self.credential {
            return Self::error(401, "invalid credential");
        }
        if !self.approved {
            return Self::json(
                403,
                &ErrorBody {
                    message: "device pending approval".into(),
                    status: Some(STATUS_PENDING_APPROVAL.into()),
                    retry_after: None,
                    rejected: Vec::new(),
                },
            );
        }
        if let Some(secs) = self.rate_limit_once.take() {
            return Self::json(
                429,
                &ErrorBody {
                    message: "rate limit exceeded".into(),
                    status: None,
                    retry_after: Some(secs),
                    rejected: Vec::new(),
                },
            );
        }

        let first = self.stored.is_empty();
        let received = req.readings.len();
        self.stored.extend(req.readings);
        Self::json(
            200,
            &SubmitReadingsResponse {
                status: STATUS_OK.into(),
                received,
                rejected: Vec::new(),
                server_time: first.then_some(self.server_time),
                reading_interval: Some(self.reading_interval),
            },
        )
    }

    fn check(&mut self, query: &str) -> Result<Response> {
        let mut q = UpdateCheckQuery::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "device_id" => q.device_id = value.into_owned(),
                "version" => q.version = value.into_owned(),
                "rolled_back" => q.rolled_back = Some(value == "true"),
                "failed_version" => q.failed_version = Some(value.into_owned()),
                "error" => q.error = Some(value.into_owned()),
                _ => {}
            }
        }

        let current = Version::parse_lossy(&q.version);
        let offer = self
            .releases
            .iter()
            .max_by_key(|(v, ..)| Version::parse_lossy(v))
            .filter(|(v, ..)| Version::parse_lossy(v) > current)
            .map(|(v, image, checksum)| UpdateCheckResponse {
                update_available: true,
                version: Some(v.clone()),
                url: Some(format!("/ota/download/{v}")),
                size: Some(image.len() as u64),
                checksum: Some(checksum.clone()),
            })
            .unwrap_or_else(UpdateCheckResponse::none);

        self.checks.push(q);
        self.last_offer = Some(offer.clone());
        Self::json(200, &offer)
    }
}

impl Http for FakeGateway {
    fn request(&mut self, method: Method, url: &str, body: Option<&[u8]>) -> Result<Response> {
        if self.down {
            bail!("connection refused");
        }
        let (path, query) = Self::path(url);
        match (method, path) {
            (Method::Post, "/register") => self.register(body.unwrap_or_default()),
            (Method::Post, "/readings") => self.submit(body.unwrap_or_default()),
            (Method::Get, "/ota/check") => self.check(query),
            _ => Self::error(404, "not found"),
        }
    }

    fn open(&mut self, url: &str) -> Result<(u16, Option<u64>)> {
        if self.down {
            bail!("connection refused");
        }
        let (path, _) = Self::path(url);
        let version = path.strip_prefix("/ota/download/").unwrap_or_default();
        let Some((_, image, _)) = self.releases.iter().find(|(v, ..)| v == version) else {
            return Ok((404, None));
        };

        let len = image.len() as u64;
        let mut body = image.clone();
        if let Some(n) = self.truncate_download {
            body.truncate(n);
        }
        self.downloads += 1;
        self.download = Some((body, 0));
        Ok((200, Some(len)))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.clock.advance(self.read_delay);
        let Some((body, pos)) = self.download.as_mut() else {
            bail!("no download in progress");
        };
        let n = buf.len().min(body.len() - *pos);
        buf[..n].copy_from_slice(&body[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.download = None;
    }
}

// ===============================================
// flash
// ===============================================

/// Two firmware slots plus the boot record, with a bootloader model.
#[derive(Debug)]
pub struct SimFlash {
    slots: [Vec<u8>; 2],
    pub running: Slot,
    pub boot_slot: Slot,
    pub record: BootRecord,
    staging: Option<Vec<u8>>,
    pub aborted: bool,
    pub fail_finish: bool,
    pub writes: usize,
    pub valid_marks: usize,
}

fn index(slot: Slot) -> usize {
    match slot {
        Slot::A => 0,
        Slot::B => 1,
    }
}

impl SimFlash {
    /// Slot A runs `version`; the image content is the version string.
    pub fn new(version: &str) -> Self {
        Self {
            slots: [version.as_bytes().to_vec(), Vec::new()],
            running: Slot::A,
            boot_slot: Slot::A,
            record: BootRecord::stable(Image {
                slot: Slot::A,
                version: version.into(),
            }),
            staging: None,
            aborted: false,
            fail_finish: false,
            writes: 0,
            valid_marks: 0,
        }
    }

    pub fn slot(&self, slot: Slot) -> &[u8] {
        &self.slots[index(slot)]
    }

    pub fn stored(&self) -> &BootRecord {
        &self.record
    }

    /// Power cycle. The bootloader starts the boot target; a candidate that
    /// does not come up counts as a failed attempt until the record falls back.
    pub fn reboot(&mut self, boots: impl Fn(&[u8]) -> bool) {
        for _ in 0..=MAX_BOOT_ATTEMPTS {
            let target = self.record.boot_target();
            if !self.record.is_candidate() || boots(self.slot(target)) {
                self.running = target;
                self.boot_slot = target;
                return;
            }
            self.record = self.record.clone().on_boot_result(BootResult::Failed);
        }
        self.running = self.record.boot_target();
        self.boot_slot = self.running;
    }
}

impl Partitions for SimFlash {
    fn running(&self) -> Slot {
        self.running
    }

    fn begin(&mut self, size: u64) -> Result<()> {
        self.staging = Some(Vec::with_capacity(size as usize));
        self.aborted = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| anyhow!("write without begin"))?;
        staging.extend_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.fail_finish {
            bail!("image validation failed");
        }
        let data = self
            .staging
            .take()
            .ok_or_else(|| anyhow!("finish without begin"))?;
        self.slots[index(self.running.other())] = data;
        Ok(())
    }

    fn abort(&mut self) {
        self.staging = None;
        self.aborted = true;
    }

    fn set_boot(&mut self, slot: Slot) -> Result<()> {
        if slot == self.running {
            bail!("slot {slot:?} is running");
        }
        self.boot_slot = slot;
        Ok(())
    }

    fn mark_running_valid(&mut self) -> Result<()> {
        self.valid_marks += 1;
        Ok(())
    }
}

impl BootStore for SimFlash {
    fn load_boot(&mut self) -> Result<Option<BootRecord>> {
        Ok(Some(self.record.clone()))
    }

    fn store_boot(&mut self, record: &BootRecord) -> Result<()> {
        self.record = record.clone();
        Ok(())
    }
}
