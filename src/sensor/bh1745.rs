//! Rohm BH1745 colour sensor over I2C
//!
//! Only the raw RGBC counts are exposed here; lux is derived from the clear
//! channel by the board adapter.

use std::thread;
use std::time::Duration;

use rppal::i2c::I2c;
use tracing::info;

use super::SensorError;

pub const DEFAULT_ADDRESS: u16 = 0x38;

const DEVICE: &str = "BH1745";
const PART_ID: u8 = 0x0B;
const MANUFACTURER_ID: u8 = 0xE0;

const REG_SYSTEM_CONTROL: u8 = 0x40;
const REG_MODE_CONTROL1: u8 = 0x41;
const REG_MODE_CONTROL2: u8 = 0x42;
const REG_MODE_CONTROL3: u8 = 0x44;
const REG_RED_DATA_LSB: u8 = 0x50;
const REG_MANUFACTURER_ID: u8 = 0x92;

const SW_RESET: u8 = 0b1000_0000;
const MEASUREMENT_TIME_320MS: u8 = 0b001;
const RGBC_EN: u8 = 0b0001_0000;
const GAIN_X1: u8 = 0b00;
const VALID: u8 = 0b1000_0000;
// datasheet: MODE_CONTROL3 must be written with 0x02
const MODE_CONTROL3_VALUE: u8 = 0x02;

const MEASUREMENT_TIME: Duration = Duration::from_millis(320);

/// Raw channel counts of one measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgbc {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub clear: u16,
}

impl Rgbc {
    pub fn from_registers(data: &[u8; 8]) -> Self {
        let word = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        Self {
            red: word(0),
            green: word(2),
            blue: word(4),
            clear: word(6),
        }
    }
}

pub struct Bh1745 {
    i2c: I2c,
}

impl Bh1745 {
    pub fn open(bus: u8, address: u16) -> Result<Self, SensorError> {
        let mut i2c = I2c::with_bus(bus).map_err(bus_error)?;
        i2c.set_slave_address(address).map_err(bus_error)?;

        let part_id = i2c.smbus_read_byte(REG_SYSTEM_CONTROL).map_err(bus_error)? & 0x3F;
        if part_id != PART_ID {
            return Err(SensorError::WrongChip {
                device: DEVICE,
                found: part_id,
            });
        }
        let manufacturer = i2c.smbus_read_byte(REG_MANUFACTURER_ID).map_err(bus_error)?;
        if manufacturer != MANUFACTURER_ID {
            return Err(SensorError::WrongChip {
                device: DEVICE,
                found: manufacturer,
            });
        }

        i2c.smbus_write_byte(REG_SYSTEM_CONTROL, SW_RESET)
            .map_err(bus_error)?;
        thread::sleep(Duration::from_millis(10));

        i2c.smbus_write_byte(REG_MODE_CONTROL1, MEASUREMENT_TIME_320MS)
            .map_err(bus_error)?;
        i2c.smbus_write_byte(REG_MODE_CONTROL2, RGBC_EN | GAIN_X1)
            .map_err(bus_error)?;
        i2c.smbus_write_byte(REG_MODE_CONTROL3, MODE_CONTROL3_VALUE)
            .map_err(bus_error)?;

        info!("BH1745 ready on bus {} at {:#04x}", bus, address);
        Ok(Self { i2c })
    }

    /// Waits for the current measurement to become valid and reads all channels
    pub fn read_rgbc(&mut self) -> Result<Rgbc, SensorError> {
        let mut polls = 0;
        while self
            .i2c
            .smbus_read_byte(REG_MODE_CONTROL2)
            .map_err(bus_error)?
            & VALID
            == 0
        {
            polls += 1;
            if polls > 4 {
                return Err(SensorError::Bus {
                    device: DEVICE,
                    reason: "measurement never became valid".to_string(),
                });
            }
            thread::sleep(MEASUREMENT_TIME);
        }

        let mut data = [0u8; 8];
        self.i2c
            .write_read(&[REG_RED_DATA_LSB], &mut data)
            .map_err(bus_error)?;
        Ok(Rgbc::from_registers(&data))
    }
}

fn bus_error(e: rppal::i2c::Error) -> SensorError {
    SensorError::Bus {
        device: DEVICE,
        reason: e.to_string(),
    }
}
