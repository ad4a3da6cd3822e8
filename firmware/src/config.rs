//! Device configuration.
//!
//! One value owned by the agent. It lives in its own non-volatile region and is
//! only written at the save points: after registration and after an OTA update
//! was confirmed.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_READING_INTERVAL: u32 = 60; // s

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub server_url: String, // without trailing slash
    pub device_id: String,
    pub credential: Option<String>, // issued at registration
    pub reading_interval: u32,      // s
}

impl DeviceConfig {
    pub fn new(device_id: &str, server_url: &str) -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            server_url: server_url.trim_end_matches('/').to_owned(),
            device_id: device_id.to_owned(),
            credential: None,
            reading_interval: DEFAULT_READING_INTERVAL,
        }
    }

    /// Factory defaults from a `.env` style text (`WIFI_SSID`, `WIFI_PW`, `SERVER_URL`).
    pub fn from_env_str(device_id: &str, env: &str) -> Result<Self> {
        let mut ssid = None;
        let mut pw = None;
        let mut server_url = None;
        for item in dotenvy::from_read_iter(env.as_bytes()) {
            let (key, value) = item.context("invalid .env")?;
            match key.as_str() {
                "WIFI_SSID" => ssid = Some(value),
                "WIFI_PW" => pw = Some(value),
                "SERVER_URL" => server_url = Some(value),
                _ => {}
            }
        }

        let server_url = server_url.ok_or_else(|| anyhow!("SERVER_URL missing"))?;
        Ok(Self {
            wifi_ssid: ssid.ok_or_else(|| anyhow!("WIFI_SSID missing"))?,
            wifi_password: pw.unwrap_or_default(),
            ..Self::new(device_id, &server_url)
        })
    }

    pub fn is_registered(&self) -> bool {
        self.credential.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

pub trait ConfigStore {
    fn load(&mut self) -> Result<Option<DeviceConfig>>;
    fn save(&mut self, config: &DeviceConfig) -> Result<()>;
}

/// RAM backed store, keeps the serialized form so the encoding is exercised too.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    pub blob: Option<Vec<u8>>,
    pub saves: usize,
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> Result<Option<DeviceConfig>> {
        self.blob
            .as_deref()
            .map(DeviceConfig::from_bytes)
            .transpose()
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<()> {
        self.blob = Some(config.to_bytes()?);
        self.saves += 1;
        Ok(())
    }
}
