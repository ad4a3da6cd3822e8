use anyhow::{bail, Result};
use esp_idf_sys::esp_efuse_mac_get_default;

pub fn mac_addr() -> Result<[u8; 6]> {
    let mut mac = [0_u8; 6];
    let ret = unsafe { esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if ret != 0 {
        bail!("Cannot get MAC ADDR");
    }

    Ok(mac)
}

/// `aa:bb:cc:dd:ee:ff`
pub fn mac_string(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Stable id derived from the MAC, `esp32-ddeeff`.
pub fn device_id(mac: &[u8; 6]) -> String {
    format!("esp32-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5])
}
