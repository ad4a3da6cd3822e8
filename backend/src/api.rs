//! Device-facing gateway: registration, telemetry ingestion and OTA distribution.

use actix_web::{get, post, web, HttpResponse};
use common::{
    req::{
        RegisterRequest, RegisterResponse, RejectedReading, SubmitReadingsResponse,
        UpdateCheckQuery, UpdateCheckResponse, STATUS_OK,
    },
    Version,
};
use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    credential,
    db::{
        models::{NewDevice, NewReading},
        update_status, Db, Registration,
    },
    error::ApiError,
    utils::unix_time,
    web::AppState,
};

const MAX_READINGS_PER_REQUEST: usize = 100;
const MAX_CLOCK_SKEW: i64 = 120; // s
const MAX_ID_LEN: usize = 50;
const MAX_UNIT_LEN: usize = 20;
const MAX_VERSION_LEN: usize = 32;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(register)
        .service(submit_readings)
        .service(ota_check)
        .service(ota_download);
}

// ===============================================
// registration
// ===============================================

#[post("/register")]
async fn register(
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<web::Json<RegisterResponse>, ApiError> {
    let RegisterRequest {
        device_id,
        firmware_version,
        mac_address,
    } = body.into_inner();

    if !valid_device_id(&device_id) {
        return Err(ApiError::validation("invalid device_id"));
    }
    if firmware_version.is_empty() || firmware_version.len() > MAX_VERSION_LEN {
        return Err(ApiError::validation("invalid firmware_version"));
    }
    let mac_address = mac_address
        .as_deref()
        .map(normalize_mac)
        .transpose()
        .map_err(|e| ApiError::validation(e))?;

    let credential = credential::generate();
    let credential_hash = credential::hash(&credential);
    let default_interval = state.settings.default_reading_interval;
    let now = unix_time();

    let db = state.db.clone();
    let id = device_id.clone();
    let (outcome, device) = web::block(move || -> anyhow::Result<_> {
        let outcome = db.register_device(&NewDevice {
            device_id: &id,
            credential_hash: &credential_hash,
            mac_address: mac_address.as_deref(),
            firmware_version: &firmware_version,
            reading_interval: default_interval,
            created_at: now,
        })?;
        Ok((outcome, db.device(&id)?))
    })
    .await??;

    match outcome {
        Registration::Created => info!("New device registered: {device_id} (approval required)"),
        Registration::Reissued => info!("Credential reissued for unclaimed device {device_id}"),
        Registration::Conflict(reason) => {
            warn!("Registration refused for {device_id}: {reason}");
            return Err(ApiError::Conflict(reason.into()));
        }
    }

    let reading_interval = device
        .map(|d| d.reading_interval)
        .unwrap_or(default_interval)
        .max(0) as u32;

    Ok(web::Json(RegisterResponse {
        credential,
        server_time: now,
        reading_interval,
    }))
}

// ===============================================
// telemetry
// ===============================================

/// Lenient view of `SubmitReadingsRequest`: elements are validated one by one
/// so a single bad reading does not reject the whole batch.
#[derive(Debug, serde::Deserialize)]
struct SubmitBody {
    device_id: String,
    #[serde(default, alias = "api_key")]
    credential: String,
    #[serde(default)]
    firmware_version: Option<String>,
    #[serde(default)]
    readings: Vec<Value>,
}

#[derive(Debug, PartialEq)]
struct ParsedReading {
    sensor: String,
    value: f64,
    unit: String,
    timestamp: Option<i64>,
}

#[post("/readings")]
async fn submit_readings(
    body: web::Json<SubmitBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let now = unix_time();

    let db = state.db.clone();
    let id = body.device_id.clone();
    let device = web::block(move || db.device(&id)).await??;

    // 1. credential, unknown devices are indistinguishable from bad credentials
    let device = match device {
        Some(device) if credential::verify(&body.credential, &device.credential_hash) => device,
        _ => {
            warn!("Invalid credential for device: {}", body.device_id);
            return Err(ApiError::Auth);
        }
    };

    if !device.claimed || !device.approved {
        let db = state.db.clone();
        let id = device.device_id.clone();
        web::block(move || db.mark_claimed(&id, now)).await??;
    }

    // 2. approval
    if !device.approved {
        info!("Unapproved device attempted to send data: {}", device.device_id);
        return Err(ApiError::PendingApproval);
    }

    // 3. rate limit
    state
        .limiter
        .check(&device.device_id)
        .map_err(|retry_after| {
            warn!(
                "Rate limit hit by {}, retry in {:?}",
                device.device_id, retry_after
            );
            ApiError::RateLimited { retry_after }
        })?;

    // 4. per-element validation
    if body.readings.is_empty() {
        return Err(ApiError::validation("readings array is required"));
    }
    if body.readings.len() > MAX_READINGS_PER_REQUEST {
        return Err(ApiError::validation(format!(
            "at most {MAX_READINGS_PER_REQUEST} readings per request"
        )));
    }

    let mut rows = Vec::with_capacity(body.readings.len());
    let mut rejected = Vec::new();
    for (index, raw) in body.readings.iter().enumerate() {
        match parse_reading(raw) {
            Ok(r) => rows.push(NewReading {
                device_id: device.device_id.clone(),
                sensor: r.sensor,
                value: r.value,
                unit: r.unit,
                device_timestamp: r.timestamp,
                received_at: now,
            }),
            Err(reason) => rejected.push(RejectedReading { index, reason }),
        }
    }
    if !rejected.is_empty() {
        warn!(
            "{} invalid reading(s) from {}: {:?}",
            rejected.len(),
            device.device_id,
            rejected
        );
    }
    if rows.is_empty() {
        return Err(ApiError::Validation {
            message: "no valid readings".into(),
            rejected,
        });
    }

    let firmware_version = body
        .firmware_version
        .filter(|v| !v.is_empty() && v.len() <= MAX_VERSION_LEN);
    let skewed = rows
        .iter()
        .filter_map(|r| r.device_timestamp)
        .any(|ts| (ts - now).abs() > MAX_CLOCK_SKEW);

    let db = state.db.clone();
    let id = device.device_id.clone();
    let received = rows.len();
    let previous_total = web::block(move || {
        db.store_readings(&id, &rows, firmware_version.as_deref(), now)
    })
    .await??;

    debug!("Received {received} readings from {}", device.device_id);

    Ok(HttpResponse::Ok().json(SubmitReadingsResponse {
        status: STATUS_OK.into(),
        received,
        rejected,
        server_time: (previous_total == 0 || skewed).then_some(now),
        reading_interval: Some(device.reading_interval.max(0) as u32),
    }))
}

fn parse_reading(raw: &Value) -> Result<ParsedReading, String> {
    let obj = raw.as_object().ok_or("reading must be an object")?;

    let sensor = obj
        .get("sensor")
        .and_then(Value::as_str)
        .ok_or("sensor is required")?;
    if !valid_sensor_name(sensor) {
        return Err("invalid sensor name".into());
    }

    let value = obj
        .get("value")
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .ok_or("value must be a number")?;

    let unit = match obj.get("unit") {
        None | Some(Value::Null) => "",
        Some(Value::String(unit)) if valid_unit(unit) => unit.as_str(),
        Some(_) => return Err("invalid unit".into()),
    };

    let timestamp = match obj.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(ts) => Some(ts.as_i64().ok_or("timestamp must be an integer")?),
    };

    Ok(ParsedReading {
        sensor: sensor.to_owned(),
        value,
        unit: unit.to_owned(),
        timestamp,
    })
}

// ===============================================
// ota
// ===============================================

#[get("/ota/check")]
async fn ota_check(
    query: web::Query<UpdateCheckQuery>,
    state: web::Data<AppState>,
) -> Result<web::Json<UpdateCheckResponse>, ApiError> {
    let query = query.into_inner();
    if query.version.len() > MAX_VERSION_LEN {
        return Err(ApiError::validation("invalid version"));
    }

    let db = state.db.clone();
    let res = web::block(move || check_update(&db, &query, unix_time())).await??;
    Ok(web::Json(res))
}

fn check_update(db: &Db, query: &UpdateCheckQuery, now: i64) -> anyhow::Result<UpdateCheckResponse> {
    let Some(device) = db.device(&query.device_id)? else {
        debug!("OTA check from unknown device {}", query.device_id);
        return Ok(UpdateCheckResponse::none());
    };

    let rolled_back = query.rolled_back == Some(true);
    if rolled_back || query.failed_version.is_some() || query.error.is_some() {
        let failed = query.failed_version.as_deref().unwrap_or("unknown");
        let status = if rolled_back {
            update_status::ROLLED_BACK
        } else {
            update_status::FAILED
        };
        warn!(
            "OTA {status} reported by {}: {failed} ({})",
            device.device_id,
            query.error.as_deref().unwrap_or("no details")
        );
        db.report_update(&device, failed, status, query.error.as_deref(), now)?;
    }

    if query.version.parse::<Version>().is_ok() {
        if device.firmware_version != query.version {
            info!(
                "{} now runs firmware {} (was {})",
                device.device_id, query.version, device.firmware_version
            );
        }
        db.set_firmware_version(&device.device_id, &query.version, now)?;
        if db.complete_download(&device.device_id, &query.version, now)? {
            info!("OTA update of {} to {} confirmed", device.device_id, query.version);
        }
    }

    let Some(latest) = db.latest_release()? else {
        return Ok(UpdateCheckResponse::none());
    };

    let current = Version::parse_lossy(&query.version);
    if Version::parse_lossy(&latest.version) <= current {
        debug!("No OTA update for {}: already on {current}", device.device_id);
        return Ok(UpdateCheckResponse::none());
    }

    info!(
        "OTA update available for {}: {current} -> {}",
        device.device_id, latest.version
    );
    Ok(UpdateCheckResponse {
        update_available: true,
        version: Some(latest.version),
        url: Some(latest.url),
        size: Some(latest.size.max(0) as u64),
        checksum: Some(latest.checksum),
    })
}

#[derive(Debug, serde::Deserialize)]
struct DownloadQuery {
    device_id: Option<String>,
}

#[get("/ota/download/{version}")]
async fn ota_download(
    path: web::Path<String>,
    query: web::Query<DownloadQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let version = path.into_inner();
    let device_id = query.into_inner().device_id;

    let db = state.db.clone();
    let requested = version.clone();
    let found = web::block(move || -> anyhow::Result<_> {
        let Some((release, data)) = db.release_binary(&requested)? else {
            return Ok(None);
        };
        if let Some(id) = device_id {
            if let Some(device) = db.device(&id)? {
                info!("OTA download started: {id} -> {}", release.version);
                db.record_download(&device, &release.version, unix_time())?;
            }
        }
        Ok(Some((release, data)))
    })
    .await??;

    let Some((release, data)) = found else {
        return Err(ApiError::NotFound(format!("firmware {version}")));
    };

    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header(("X-Checksum", release.checksum))
        .body(data))
}

// ===============================================
// input validation
// ===============================================

fn valid_device_id(id: &str) -> bool {
    (1..=MAX_ID_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

fn valid_sensor_name(name: &str) -> bool {
    (1..=MAX_ID_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

fn valid_unit(unit: &str) -> bool {
    unit.chars().count() <= MAX_UNIT_LEN && !unit.chars().any(char::is_control)
}

/// `AA-BB-CC-DD-EE-FF` / `aa:bb:cc:dd:ee:ff` -> `aa:bb:cc:dd:ee:ff`
fn normalize_mac(mac: &str) -> Result<String, String> {
    let octets: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.bytes().all(|b| b.is_ascii_hexdigit()));
    if !valid {
        return Err("invalid mac_address".into());
    }
    Ok(octets.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_valid_reading() {
        let r = parse_reading(&json!({
            "sensor": "temperature", "value": 21.5, "unit": "C", "timestamp": 1700000000
        }))
        .unwrap();
        assert_eq!(
            r,
            ParsedReading {
                sensor: "temperature".into(),
                value: 21.5,
                unit: "C".into(),
                timestamp: Some(1_700_000_000),
            }
        );

        let r = parse_reading(&json!({ "sensor": "heartbeat", "value": 1 })).unwrap();
        assert_eq!(r.value, 1.0);
        assert_eq!(r.unit, "");
        assert_eq!(r.timestamp, None);
    }

    #[test]
    fn rejects_invalid_readings() {
        let bad = [
            json!(42),
            json!({ "value": 1 }),
            json!({ "sensor": "temp; DROP TABLE", "value": 1 }),
            json!({ "sensor": "", "value": 1 }),
            json!({ "sensor": "t", "value": "hot" }),
            json!({ "sensor": "t", "value": null }),
            json!({ "sensor": "t", "value": 1, "unit": 5 }),
            json!({ "sensor": "t", "value": 1, "unit": "way too long for any sane unit" }),
            json!({ "sensor": "t", "value": 1, "timestamp": "yesterday" }),
        ];
        for reading in bad {
            assert!(parse_reading(&reading).is_err(), "{reading}");
        }
    }

    #[test]
    fn identifiers() {
        assert!(valid_device_id("esp32-a1b2c3"));
        assert!(!valid_device_id(""));
        assert!(!valid_device_id("esp 32"));
        assert!(!valid_device_id(&"x".repeat(51)));
        assert!(valid_sensor_name("air_quality.iaq"));
        assert!(!valid_sensor_name("temp/1"));
    }

    #[test]
    fn mac_normalisation() {
        assert_eq!(
            normalize_mac("AA-BB-CC-00-11-22").unwrap(),
            "aa:bb:cc:00:11:22"
        );
        assert!(normalize_mac("aa:bb:cc").is_err());
        assert!(normalize_mac("zz:bb:cc:00:11:22").is_err());
    }
}
