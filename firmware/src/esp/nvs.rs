use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::config::{ConfigStore, DeviceConfig};

const MAX_BLOB: usize = 512;

/// One postcard blob under a key in its own NVS namespace.
pub struct NvsBlob {
    nvs: EspNvs<NvsDefault>,
    key: &'static str,
}

impl NvsBlob {
    pub fn new(partition: EspDefaultNvsPartition, namespace: &str, key: &'static str) -> Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, namespace, true)?,
            key,
        })
    }

    pub fn get(&self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0_u8; MAX_BLOB];
        Ok(self.nvs.get_raw(self.key, &mut buf)?.map(|b| b.to_vec()))
    }

    pub fn set(&mut self, data: &[u8]) -> Result<()> {
        self.nvs.set_raw(self.key, data)?;
        Ok(())
    }
}

pub struct NvsConfigStore {
    blob: NvsBlob,
}

impl NvsConfigStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        Ok(Self {
            blob: NvsBlob::new(partition, "config", "device")?,
        })
    }
}

impl ConfigStore for NvsConfigStore {
    fn load(&mut self) -> Result<Option<DeviceConfig>> {
        self.blob
            .get()?
            .as_deref()
            .map(DeviceConfig::from_bytes)
            .transpose()
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<()> {
        self.blob.set(&config.to_bytes()?)
    }
}
