//! Bosch BME280 temperature / pressure / humidity sensor over I2C
//!
//! Samples in forced mode (one conversion per read, x1 oversampling on all
//! channels) and compensates with the floating point formulas from the
//! datasheet (section 8.1).

use std::thread;
use std::time::Duration;

use rppal::i2c::I2c;
use tracing::{debug, info};

use super::SensorError;

pub const DEFAULT_ADDRESS: u16 = 0x76;

const DEVICE: &str = "BME280";
const CHIP_ID: u8 = 0x60;

const REG_CALIB_00: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_26: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

const SOFT_RESET: u8 = 0xB6;
const OVERSAMPLING_X1: u8 = 0b001;
const MODE_FORCED: u8 = 0b01;
const STATUS_MEASURING: u8 = 0b1000;

/// Factory trimming parameters read once at startup
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Decodes the 0x88..0xA1 and 0xE1..0xE7 register blocks
    pub fn from_registers(block_a: &[u8; 26], block_b: &[u8; 7]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([block_a[i], block_a[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([block_a[i], block_a[i + 1]]);

        Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            h1: block_a[25],
            h2: i16::from_le_bytes([block_b[0], block_b[1]]),
            h3: block_b[2],
            // H4 and H5 share the nibbles of 0xE5
            h4: ((block_b[3] as i8 as i16) << 4) | (block_b[4] & 0x0F) as i16,
            h5: ((block_b[5] as i8 as i16) << 4) | (block_b[4] >> 4) as i16,
            h6: block_b[6] as i8,
        }
    }
}

/// Uncompensated ADC values of one conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcSample {
    pub temperature: i32,
    pub pressure: i32,
    pub humidity: i32,
}

impl AdcSample {
    pub fn from_registers(data: &[u8; 8]) -> Self {
        let twenty_bit =
            |msb: u8, lsb: u8, xlsb: u8| ((msb as i32) << 12) | ((lsb as i32) << 4) | ((xlsb as i32) >> 4);
        Self {
            pressure: twenty_bit(data[0], data[1], data[2]),
            temperature: twenty_bit(data[3], data[4], data[5]),
            humidity: ((data[6] as i32) << 8) | data[7] as i32,
        }
    }
}

/// Compensated values in °C, hPa and %RH
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
}

/// Returns `(temperature °C, t_fine)`
pub fn compensate_temperature(adc_t: i32, cal: &Calibration) -> (f64, f64) {
    let adc_t = adc_t as f64;
    let t1 = cal.t1 as f64;
    let var1 = (adc_t / 16384.0 - t1 / 1024.0) * cal.t2 as f64;
    let var2 = (adc_t / 131072.0 - t1 / 8192.0).powi(2) * cal.t3 as f64;
    let t_fine = var1 + var2;
    (t_fine / 5120.0, t_fine)
}

/// Pressure in Pascal
pub fn compensate_pressure(adc_p: i32, t_fine: f64, cal: &Calibration) -> f64 {
    let mut var1 = t_fine / 2.0 - 64000.0;
    let mut var2 = var1 * var1 * cal.p6 as f64 / 32768.0;
    var2 += var1 * cal.p5 as f64 * 2.0;
    var2 = var2 / 4.0 + cal.p4 as f64 * 65536.0;
    var1 = (cal.p3 as f64 * var1 * var1 / 524288.0 + cal.p2 as f64 * var1) / 524288.0;
    var1 = (1.0 + var1 / 32768.0) * cal.p1 as f64;
    if var1 == 0.0 {
        // avoid division by zero on a blank calibration
        return 0.0;
    }
    let mut p = 1048576.0 - adc_p as f64;
    p = (p - var2 / 4096.0) * 6250.0 / var1;
    var1 = cal.p9 as f64 * p * p / 2147483648.0;
    var2 = p * cal.p8 as f64 / 32768.0;
    p + (var1 + var2 + cal.p7 as f64) / 16.0
}

/// Relative humidity in percent, clamped to 0..=100
pub fn compensate_humidity(adc_h: i32, t_fine: f64, cal: &Calibration) -> f64 {
    let mut h = t_fine - 76800.0;
    h = (adc_h as f64 - (cal.h4 as f64 * 64.0 + cal.h5 as f64 / 16384.0 * h))
        * (cal.h2 as f64 / 65536.0
            * (1.0 + cal.h6 as f64 / 67108864.0 * h * (1.0 + cal.h3 as f64 / 67108864.0 * h)));
    h *= 1.0 - cal.h1 as f64 * h / 524288.0;
    h.clamp(0.0, 100.0)
}

pub fn compensate(adc: &AdcSample, cal: &Calibration) -> Measurement {
    let (temperature, t_fine) = compensate_temperature(adc.temperature, cal);
    Measurement {
        temperature,
        pressure: compensate_pressure(adc.pressure, t_fine, cal) / 100.0,
        humidity: compensate_humidity(adc.humidity, t_fine, cal),
    }
}

pub struct Bme280 {
    i2c: I2c,
    calibration: Calibration,
}

impl Bme280 {
    /// Opens the chip on `bus`, verifies its id and loads the trimming data
    pub fn open(bus: u8, address: u16) -> Result<Self, SensorError> {
        let mut i2c = I2c::with_bus(bus).map_err(bus_error)?;
        i2c.set_slave_address(address).map_err(bus_error)?;

        let chip_id = i2c.smbus_read_byte(REG_CHIP_ID).map_err(bus_error)?;
        if chip_id != CHIP_ID {
            return Err(SensorError::WrongChip {
                device: DEVICE,
                found: chip_id,
            });
        }

        i2c.smbus_write_byte(REG_RESET, SOFT_RESET).map_err(bus_error)?;
        thread::sleep(Duration::from_millis(5));

        let mut block_a = [0u8; 26];
        let mut block_b = [0u8; 7];
        i2c.write_read(&[REG_CALIB_00], &mut block_a)
            .map_err(bus_error)?;
        i2c.write_read(&[REG_CALIB_26], &mut block_b)
            .map_err(bus_error)?;
        let calibration = Calibration::from_registers(&block_a, &block_b);
        debug!("BME280 calibration: {:?}", calibration);

        info!("BME280 ready on bus {} at {:#04x}", bus, address);
        Ok(Self { i2c, calibration })
    }

    /// Triggers one forced-mode conversion and returns the compensated values
    pub fn measure(&mut self) -> Result<Measurement, SensorError> {
        // ctrl_hum only takes effect after the following ctrl_meas write
        self.i2c
            .smbus_write_byte(REG_CTRL_HUM, OVERSAMPLING_X1)
            .map_err(bus_error)?;
        self.i2c
            .smbus_write_byte(
                REG_CTRL_MEAS,
                (OVERSAMPLING_X1 << 5) | (OVERSAMPLING_X1 << 2) | MODE_FORCED,
            )
            .map_err(bus_error)?;

        let mut polls = 0;
        while self.i2c.smbus_read_byte(REG_STATUS).map_err(bus_error)? & STATUS_MEASURING != 0 {
            polls += 1;
            if polls > 50 {
                return Err(SensorError::Bus {
                    device: DEVICE,
                    reason: "conversion did not finish".to_string(),
                });
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut data = [0u8; 8];
        self.i2c
            .write_read(&[REG_DATA], &mut data)
            .map_err(bus_error)?;
        Ok(compensate(&AdcSample::from_registers(&data), &self.calibration))
    }
}

fn bus_error(e: rppal::i2c::Error) -> SensorError {
    SensorError::Bus {
        device: DEVICE,
        reason: e.to_string(),
    }
}
