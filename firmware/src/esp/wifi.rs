use std::{net::Ipv4Addr, time::Duration};

use anyhow::bail;
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, Wifi};
use log::info;

use esp_idf_hal::peripheral;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    netif::{EspNetif, EspNetifWait},
    nvs::EspDefaultNvsPartition,
    wifi::{EspWifi, WifiWait},
};
use heapless::String;

use crate::config::DeviceConfig;

/// Station mode. Fails when the configured network is not in range or no DHCP lease arrives.
pub fn setup_wifi(
    modem: impl peripheral::Peripheral<P = esp_idf_hal::modem::Modem> + 'static,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    config: &DeviceConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let ssid = config.wifi_ssid.as_str();
    let pw = config.wifi_password.as_str();
    if ssid.len() > 32 || pw.len() > 64 {
        bail!("Wifi credentials too long");
    }

    let mut wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs))?);

    info!("Scanning...");
    let aps = wifi.scan()?; // sorted by strength
    let Some(ap) = aps.iter().find(|a| a.ssid == ssid) else {
        bail!("Wifi '{ssid}' not found");
    };

    let client_config = ClientConfiguration {
        ssid: ap.ssid.to_owned(),
        bssid: None,
        auth_method: if pw.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        password: String::from(pw),
        channel: Some(ap.channel),
    };
    wifi.set_configuration(&Configuration::Client(client_config))?;

    info!("Starting Wifi...");
    wifi.start()?;

    if !WifiWait::new(&sys_loop)?
        .wait_with_timeout(Duration::from_secs(20), || wifi.is_started().unwrap_or(false))
    {
        bail!("Wifi did not start");
    }

    let mut retries = 3;
    loop {
        info!("Connecting with '{ssid}'...");
        wifi.connect()?;
        retries -= 1;

        let connected = EspNetifWait::new::<EspNetif>(wifi.sta_netif(), &sys_loop)?
            .wait_with_timeout(Duration::from_secs(10), || {
                wifi.is_connected().unwrap_or(false)
                    && wifi
                        .sta_netif()
                        .get_ip_info()
                        .map(|info| info.ip != Ipv4Addr::new(0, 0, 0, 0))
                        .unwrap_or(false)
            });
        if connected {
            break;
        }
        if retries == 0 {
            bail!("Wifi did not connect or did not receive a DHCP lease");
        }
    }

    let ip_info = wifi.sta_netif().get_ip_info()?;
    info!("Wifi DHCP info: {:?}", ip_info);

    Ok(wifi)
}
