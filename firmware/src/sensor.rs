use common::req::Reading;

pub trait Sensor {
    /// Takes one measurement. `timestamp` is the device clock, if it was ever synchronised.
    fn sample(&mut self, timestamp: Option<i64>) -> anyhow::Result<Vec<Reading>>;
}

/// Stand-in reading when no sensor is attached, keeps `last_seen` moving.
pub fn heartbeat(timestamp: Option<i64>) -> Reading {
    Reading {
        sensor: "heartbeat".into(),
        value: 1.0,
        unit: "status".into(),
        timestamp,
    }
}

/// AHT20 humidity/temperature frame decoding.
pub mod aht20 {
    use anyhow::{bail, Result};

    pub const ADDR: u8 = 0x38;
    pub const CMD_INIT: [u8; 3] = [0xBE, 0x08, 0x00];
    pub const CMD_MEASURE: [u8; 3] = [0xAC, 0x33, 0x00];

    const STATUS_BUSY: u8 = 0x80;
    const FULL_SCALE: f64 = (1u32 << 20) as f64;

    fn crc8(data: &[u8]) -> u8 {
        let mut crc = 0xFF_u8;
        for byte in data {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 {
                    (crc << 1) ^ 0x31
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    /// Status, 20 bit humidity, 20 bit temperature, crc. Returns (°C, %RH).
    pub fn decode(frame: &[u8; 7]) -> Result<(f64, f64)> {
        if frame[0] & STATUS_BUSY != 0 {
            bail!("measurement not ready");
        }
        if crc8(&frame[..6]) != frame[6] {
            bail!("crc mismatch");
        }

        let hum_raw =
            (frame[1] as u32) << 12 | (frame[2] as u32) << 4 | (frame[3] as u32) >> 4;
        let temp_raw = ((frame[3] & 0x0F) as u32) << 16 | (frame[4] as u32) << 8 | frame[5] as u32;

        let humidity = hum_raw as f64 / FULL_SCALE * 100.0;
        let temperature = temp_raw as f64 / FULL_SCALE * 200.0 - 50.0;
        Ok((temperature, humidity))
    }

}
