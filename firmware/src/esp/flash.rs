use std::ptr;

use anyhow::{bail, Result};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_handle_t, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP,
};
use log::info;

use super::nvs::NvsBlob;
use crate::boot::{BootRecord, BootStore, Partitions, Slot};

/// `ota_0`/`ota_1` app partitions plus the boot record in NVS.
pub struct EspFlash {
    handle: Option<esp_ota_handle_t>,
    record: NvsBlob,
}

impl EspFlash {
    pub fn new(nvs: EspDefaultNvsPartition) -> Result<Self> {
        Ok(Self {
            handle: None,
            record: NvsBlob::new(nvs, "boot", "record")?,
        })
    }

    fn partition(slot: Slot) -> Result<*const esp_partition_t> {
        let subtype = match slot {
            Slot::A => esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
            Slot::B => esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1,
        };
        let p = unsafe {
            esp_partition_find_first(esp_partition_type_t_ESP_PARTITION_TYPE_APP, subtype, ptr::null())
        };
        if p.is_null() {
            bail!("no app partition for slot {slot:?}");
        }
        Ok(p)
    }

    fn handle(&self) -> Result<esp_ota_handle_t> {
        match self.handle {
            Some(h) => Ok(h),
            None => bail!("no OTA write in progress"),
        }
    }
}

impl Partitions for EspFlash {
    fn running(&self) -> Slot {
        let p = unsafe { esp_ota_get_running_partition() };
        if !p.is_null() && unsafe { (*p).subtype } == esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1 {
            Slot::B
        } else {
            Slot::A
        }
    }

    fn begin(&mut self, size: u64) -> Result<()> {
        let target = unsafe { esp_ota_get_next_update_partition(ptr::null()) };
        if target.is_null() {
            bail!("no update partition");
        }
        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(target, size as usize, &mut handle) })?;
        self.handle = Some(handle);
        info!("OTA partition erased for {size} bytes");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        esp!(unsafe { esp_ota_write(handle, data.as_ptr().cast(), data.len()) })?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let handle = self.handle()?;
        self.handle = None;
        // validates the image header and segments
        esp!(unsafe { esp_ota_end(handle) })?;
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { esp_ota_abort(handle) };
        }
    }

    fn set_boot(&mut self, slot: Slot) -> Result<()> {
        let p = Self::partition(slot)?;
        esp!(unsafe { esp_ota_set_boot_partition(p) })?;
        Ok(())
    }

    fn mark_running_valid(&mut self) -> Result<()> {
        esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() })?;
        Ok(())
    }
}

impl BootStore for EspFlash {
    fn load_boot(&mut self) -> Result<Option<BootRecord>> {
        match self.record.get()? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_boot(&mut self, record: &BootRecord) -> Result<()> {
        self.record.set(&postcard::to_allocvec(record)?)
    }
}
