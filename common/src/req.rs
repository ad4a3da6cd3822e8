// keep in sync with the handlers in backend/src/api.rs

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub firmware_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RegisterResponse {
    pub credential: String,
    pub server_time: i64,      // s
    pub reading_interval: u32, // s
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Reading {
    pub sensor: String,
    pub value: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>, // s, device clock
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SubmitReadingsRequest {
    pub device_id: String,
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    pub readings: Vec<Reading>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RejectedReading {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SubmitReadingsResponse {
    pub status: String,
    pub received: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_interval: Option<u32>,
}

/// Query string of `GET /ota/check`. The optional fields carry the outcome of
/// the previous update attempt so the operator can see it.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct UpdateCheckQuery {
    pub device_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UpdateCheckResponse {
    pub update_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>, // bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>, // sha256, lowercase hex
}

impl UpdateCheckResponse {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>, // s
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedReading>,
}

pub const STATUS_OK: &str = "ok";
pub const STATUS_PENDING_APPROVAL: &str = "pending_approval";
