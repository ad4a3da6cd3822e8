use std::time::Duration;

use anyhow::Result;
use common::req::Reading;
use esp_idf_hal::gpio::{InputPin, OutputPin};
use esp_idf_hal::units::*;
use esp_idf_hal::{i2c, peripheral};
use log::info;

use crate::sensor::{aht20, Sensor};

const TIMEOUT: u32 = 10000;

pub struct Aht20 {
    interface: i2c::I2cDriver<'static>,
}

impl Aht20 {
    pub fn new(
        i2c: impl peripheral::Peripheral<P = impl i2c::I2c> + 'static,
        sda: impl peripheral::Peripheral<P = impl InputPin + OutputPin> + 'static,
        scl: impl peripheral::Peripheral<P = impl InputPin + OutputPin> + 'static,
    ) -> Result<Self> {
        let i2c_conf = i2c::I2cConfig::new().baudrate(100.kHz().into());
        let mut interface = i2c::I2cDriver::new(i2c, sda, scl, &i2c_conf)?;

        interface.write(aht20::ADDR, &aht20::CMD_INIT, TIMEOUT)?;
        std::thread::sleep(Duration::from_millis(10));
        info!("AHT20 initialised");

        Ok(Self { interface })
    }
}

impl Sensor for Aht20 {
    fn sample(&mut self, timestamp: Option<i64>) -> Result<Vec<Reading>> {
        self.interface
            .write(aht20::ADDR, &aht20::CMD_MEASURE, TIMEOUT)?;
        std::thread::sleep(Duration::from_millis(80));

        let mut frame = [0_u8; 7];
        self.interface.read(aht20::ADDR, &mut frame, TIMEOUT)?;
        let (temperature, humidity) = aht20::decode(&frame)?;

        Ok(vec![
            Reading {
                sensor: "temperature".into(),
                value: (temperature * 100.0).round() / 100.0,
                unit: "C".into(),
                timestamp,
            },
            Reading {
                sensor: "humidity".into(),
                value: (humidity * 100.0).round() / 100.0,
                unit: "%".into(),
                timestamp,
            },
        ])
    }
}
