//! Weather board adapter: BME280 + BH1745 on one I2C bus

use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use super::bh1745::{self, Bh1745};
use super::bme280::{self, Bme280, Measurement};
use super::{SensorError, SensorPort};
use crate::reading::{round1, RawSample};

pub const DEFAULT_BUS: u8 = 1;

/// Counts per lux on the clear channel at 1x gain / 320 ms
const CLEAR_COUNTS_PER_LUX: f64 = 1.638375;
const MAX_LUX: f64 = 40_000.0;
const MAX_AMBIENT_LUX: f64 = 10_000.0;

/// What the BME280 reports before its first real conversion
const POWER_ON_SAMPLE: (f64, f64, f64) = (22.0, 82.3, 684.3);

const WARM_UP_SETTLE: Duration = Duration::from_secs(1);

pub struct WeatherBoard {
    climate: Bme280,
    light: Bh1745,
}

impl WeatherBoard {
    /// Opens both chips and discards one warm-up sample
    ///
    /// The first conversion after power-up is unreliable on these parts, so it
    /// is read and thrown away before the board is handed to the scheduler.
    pub fn open(bus: u8) -> Result<Self, SensorError> {
        let climate = Bme280::open(bus, bme280::DEFAULT_ADDRESS)?;
        let light = Bh1745::open(bus, bh1745::DEFAULT_ADDRESS)?;
        let mut board = Self { climate, light };

        match board.sample() {
            Ok(warm_up) => debug!("Discarded warm-up sample: {:?}", warm_up),
            Err(e) => warn!("Warm-up sample failed: {}", e),
        }
        thread::sleep(WARM_UP_SETTLE);

        info!("Weather board initialised on I2C bus {}", bus);
        Ok(board)
    }

    fn sample(&mut self) -> Result<RawSample, SensorError> {
        let climate = self.climate.measure()?;
        let rgbc = self.light.read_rgbc()?;
        trace!(
            "BH1745 r={} g={} b={} c={}",
            rgbc.red,
            rgbc.green,
            rgbc.blue,
            rgbc.clear
        );
        let (lux, ambient_lux) = lux_from_clear(rgbc.clear);

        Ok(RawSample {
            captured_at: Utc::now(),
            temperature: climate.temperature,
            pressure: climate.pressure,
            humidity: climate.humidity,
            lux,
            ambient_lux,
        })
    }
}

impl SensorPort for WeatherBoard {
    fn read_raw(&mut self) -> Result<RawSample, SensorError> {
        let sample = self.sample()?;
        let climate = Measurement {
            temperature: sample.temperature,
            pressure: sample.pressure,
            humidity: sample.humidity,
        };
        if is_power_on_sample(&climate) {
            return Err(SensorError::InvalidSample(format!(
                "BME280 power-on values (temp={:.1} hum={:.1} pres={:.1})",
                climate.temperature, climate.humidity, climate.pressure
            )));
        }
        Ok(sample)
    }
}

/// Converts clear channel counts into `(lux, ambient_lux)`
///
/// Lux is rounded to the nearest hundred and clamped to 0..=40000; the
/// ambient value is the same figure capped at 10000.
pub fn lux_from_clear(clear: u16) -> (f64, f64) {
    let raw_lux = clear as f64 / CLEAR_COUNTS_PER_LUX;
    let lux = round_to_hundreds(raw_lux).clamp(0.0, MAX_LUX);
    (lux, lux.min(MAX_AMBIENT_LUX))
}

/// Halves go to the even hundred: 250 becomes 200, 350 becomes 400
fn round_to_hundreds(value: f64) -> f64 {
    (value / 100.0).round_ties_even() * 100.0
}

/// Matches the BME280 power-on values
///
/// Checked on the raw sample rather than the calibrated one, so a non-zero
/// calibration offset cannot hide the bogus reading.
pub fn is_power_on_sample(m: &Measurement) -> bool {
    let (temperature, humidity, pressure) = POWER_ON_SAMPLE;
    round1(m.temperature) == temperature
        && round1(m.humidity) == humidity
        && round1(m.pressure) == pressure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lux_rounds_to_hundreds() {
        // 1638 counts is just under 1000 lx
        assert_eq!(lux_from_clear(1638), (1000.0, 1000.0));
        assert_eq!(lux_from_clear(0), (0.0, 0.0));
        assert_eq!(lux_from_clear(50), (0.0, 0.0));
    }

    #[test]
    fn lux_halves_round_to_even_hundreds() {
        assert_eq!(round_to_hundreds(250.0), 200.0);
        assert_eq!(round_to_hundreds(350.0), 400.0);
        assert_eq!(round_to_hundreds(1050.0), 1000.0);
        assert_eq!(round_to_hundreds(251.0), 300.0);
    }

    #[test]
    fn ambient_lux_is_capped_below_lux() {
        let (lux, ambient) = lux_from_clear(32768);
        assert_eq!(lux, 20000.0);
        assert_eq!(ambient, 10000.0);
    }

    #[test]
    fn lux_is_clamped_at_the_top() {
        let (lux, ambient) = lux_from_clear(u16::MAX);
        assert_eq!(lux, 40000.0);
        assert_eq!(ambient, 10000.0);
    }

    #[test]
    fn power_on_sample_is_recognised() {
        let bogus = Measurement {
            temperature: 21.98,
            humidity: 82.31,
            pressure: 684.27,
        };
        assert!(is_power_on_sample(&bogus));

        let real = Measurement {
            temperature: 22.0,
            humidity: 55.0,
            pressure: 1012.0,
        };
        assert!(!is_power_on_sample(&real));
    }
}
