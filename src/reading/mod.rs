//! Sensor readings and the calibration step
//!
//! A [`RawSample`] comes straight from the sensor adapter. [`calibrate`] turns it
//! into the immutable [`Reading`] that the rest of a tick works with:
//!
//! ```text
//! SensorPort ──► RawSample ──► calibrate(offsets) ──► Reading ──► fan-out / persistence
//! ```
//!
//! Derived values (dew point, corrected humidity) are computed from the
//! calibrated reading on demand and never stored back into it.

pub mod payload;

use chrono::{DateTime, Utc};

/// Magnus coefficients for water vapour over liquid water
const MAGNUS_A: f64 = 17.27;
const MAGNUS_B: f64 = 237.7;

/// One uncalibrated sample as delivered by the sensor adapter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub captured_at: DateTime<Utc>,
    /// Degrees Celsius
    pub temperature: f64,
    /// Hectopascal
    pub pressure: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Lux derived from the clear channel
    pub lux: f64,
    /// Light baseline, kept uncalibrated next to `lux`
    pub ambient_lux: f64,
}

/// Additive per-channel corrections
///
/// Offsets are not bounds checked. A large offset can shift a reading out of
/// the physically plausible range and that is left to the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationOffsets {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub lux: f64,
}

impl CalibrationOffsets {
    pub fn is_zero(&self) -> bool {
        self.temperature == 0.0 && self.pressure == 0.0 && self.humidity == 0.0 && self.lux == 0.0
    }
}

/// Calibrated snapshot produced once per tick
///
/// Fields are private so a reading cannot be changed after [`calibrate`]
/// created it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    timestamp: DateTime<Utc>,
    temperature: f64,
    pressure: f64,
    humidity: f64,
    lux: f64,
    ambient_lux: f64,
}

/// Applies `offsets` to `raw` exactly once
///
/// Pure and infallible. NaN or infinite inputs propagate unchanged.
pub fn calibrate(raw: &RawSample, offsets: &CalibrationOffsets) -> Reading {
    Reading {
        timestamp: raw.captured_at,
        temperature: raw.temperature + offsets.temperature,
        pressure: raw.pressure + offsets.pressure,
        humidity: raw.humidity + offsets.humidity,
        lux: raw.lux + offsets.lux,
        ambient_lux: raw.ambient_lux,
    }
}

impl Reading {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    pub fn lux(&self) -> f64 {
        self.lux
    }

    pub fn ambient_lux(&self) -> f64 {
        self.ambient_lux
    }

    /// Dew point in degrees Celsius (Magnus formula)
    ///
    /// Humidity is clamped to (0, 100] before taking the logarithm.
    pub fn dew_point(&self) -> f64 {
        let rh_fraction = (self.humidity / 100.0).clamp(1e-6, 1.0);
        let gamma =
            (MAGNUS_A * self.temperature) / (MAGNUS_B + self.temperature) + rh_fraction.ln();
        (MAGNUS_B * gamma) / (MAGNUS_A - gamma)
    }

    /// Humidity estimate derived from the temperature / dew point spread
    pub fn corrected_humidity(&self) -> f64 {
        100.0 - 5.0 * (self.temperature - self.dew_point())
    }
}

/// Rounds to one decimal place, the precision used on the wire and in the store
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(temperature: f64) -> RawSample {
        RawSample {
            captured_at: Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
            temperature,
            pressure: 1013.25,
            humidity: 45.0,
            lux: 1200.0,
            ambient_lux: 1200.0,
        }
    }

    #[test]
    fn offsets_are_added_per_channel() {
        let offsets = CalibrationOffsets {
            temperature: -2.0,
            pressure: 1.5,
            humidity: -3.0,
            lux: 100.0,
        };
        let reading = calibrate(&raw(24.0), &offsets);

        assert_eq!(reading.temperature(), 22.0);
        assert_eq!(reading.pressure(), 1014.75);
        assert_eq!(reading.humidity(), 42.0);
        assert_eq!(reading.lux(), 1300.0);
    }

    #[test]
    fn ambient_lux_and_timestamp_are_copied() {
        let sample = raw(20.0);
        let offsets = CalibrationOffsets {
            lux: 500.0,
            ..Default::default()
        };
        let reading = calibrate(&sample, &offsets);

        assert_eq!(reading.ambient_lux(), sample.ambient_lux);
        assert_eq!(reading.timestamp(), sample.captured_at);
    }

    #[test]
    fn zero_offsets_leave_the_sample_unchanged() {
        let sample = raw(18.3);
        let offsets = CalibrationOffsets::default();
        assert!(offsets.is_zero());

        let reading = calibrate(&sample, &offsets);
        assert_eq!(reading.temperature(), sample.temperature);
        assert_eq!(reading.pressure(), sample.pressure);
        assert_eq!(reading.humidity(), sample.humidity);
        assert_eq!(reading.lux(), sample.lux);
    }

    #[test]
    fn calibration_is_not_cumulative() {
        let offsets = CalibrationOffsets {
            temperature: 1.0,
            ..Default::default()
        };
        let first = calibrate(&raw(10.0), &offsets);
        let second = calibrate(&raw(10.0), &offsets);
        assert_eq!(first.temperature(), 11.0);
        assert_eq!(second.temperature(), 11.0);
    }

    #[test]
    fn nan_propagates() {
        let reading = calibrate(&raw(f64::NAN), &CalibrationOffsets::default());
        assert!(reading.temperature().is_nan());
    }

    #[test]
    fn dew_point_matches_reference_values() {
        // 20 °C at 50 %RH has a dew point of about 9.3 °C
        let mut sample = raw(20.0);
        sample.humidity = 50.0;
        let reading = calibrate(&sample, &CalibrationOffsets::default());
        assert!((reading.dew_point() - 9.26).abs() < 0.05);

        // Saturated air: dew point equals air temperature
        sample.humidity = 100.0;
        let reading = calibrate(&sample, &CalibrationOffsets::default());
        assert!((reading.dew_point() - 20.0).abs() < 1e-9);
        assert!((reading.corrected_humidity() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn dew_point_survives_zero_humidity() {
        let mut sample = raw(20.0);
        sample.humidity = 0.0;
        let reading = calibrate(&sample, &CalibrationOffsets::default());
        assert!(reading.dew_point().is_finite());
    }

    #[test]
    fn rounding_to_one_decimal() {
        assert_eq!(round1(22.04), 22.0);
        assert_eq!(round1(22.06), 22.1);
        assert_eq!(round1(-1.26), -1.3);
    }
}
