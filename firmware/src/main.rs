use std::time::Duration;

use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use esp_idf_sys as _; // If using the `binstart` feature of `esp-idf-sys`, always keep this module imported
use log::{error, info, warn};

use firmware::{
    agent::Parts,
    clock::SystemClock,
    config::{ConfigStore, DeviceConfig},
    esp::{
        aht20::Aht20, flash::EspFlash, http::EspHttp, nvs::NvsConfigStore, utils,
        watchdog::TaskWatchdog, wifi, Esp,
    },
    sensor::Sensor,
    Agent,
};

const ENV_STR: &str = include_str!("../.env");
const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

// -----------------
// pin definitions
// -----------------
// IO4:  SDA (AHT20)
// IO5:  SCL (AHT20)
//
// flash command:
// cargo build --features esp && espflash /dev/ttyACM0 target/riscv32imc-esp-espidf/debug/firmware --monitor --speed 921600

fn main() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("Firmware {FIRMWARE_VERSION}");

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let mac = utils::mac_addr()?;
    let device_id = utils::device_id(&mac);
    let defaults = DeviceConfig::from_env_str(&device_id, ENV_STR)?;

    let mut config_store = NvsConfigStore::new(nvs.clone())?;
    let config = config_store.load()?.unwrap_or_else(|| defaults.clone());

    // wifi
    let _wifi = match wifi::setup_wifi(peripherals.modem, sys_loop, nvs.clone(), &config) {
        Ok(wifi) => wifi,
        Err(e) => {
            error!("Wifi setup failed: {e:#}, restarting in 30 s");
            std::thread::sleep(Duration::from_secs(30));
            esp_idf_hal::reset::restart();
        }
    };

    // sensor
    let sensor: Option<Box<dyn Sensor>> = match Aht20::new(
        peripherals.i2c0,
        peripherals.pins.gpio4,
        peripherals.pins.gpio5,
    ) {
        Ok(aht20) => Some(Box::new(aht20)),
        Err(e) => {
            warn!("No AHT20 found ({e:#}), sending heartbeats");
            None
        }
    };

    let parts = Parts::<Esp> {
        http: EspHttp::new()?,
        config: config_store,
        flash: EspFlash::new(nvs)?,
        clock: SystemClock::new(),
        watchdog: TaskWatchdog::new(),
    };
    let mut agent = Agent::<Esp>::new(
        parts,
        defaults,
        FIRMWARE_VERSION,
        sensor,
        Some(utils::mac_string(&mac)),
    )?;

    let reason = agent.run();
    info!("Restarting: {reason:?}");
    std::thread::sleep(Duration::from_millis(500));
    esp_idf_hal::reset::restart();
}
