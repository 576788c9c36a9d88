//! Wire format for published readings
//!
//! Subscribers depend on both the topic and the field names below, so they
//! stay fixed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{round1, Reading};

/// Sub-topic appended to the configured prefix
pub const WEATHER_TOPIC_SUFFIX: &str = "WeatherData";

/// Full topic for a prefix such as `Weatherstation/`
pub fn weather_topic(topic_prefix: &str) -> String {
    format!("{topic_prefix}{WEATHER_TOPIC_SUFFIX}")
}

/// Flat JSON record sent to every broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingPayload {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub dew_point: f64,
    pub lx: f64,
    pub ambient_lux: f64,
}

impl From<&Reading> for ReadingPayload {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp(),
            temperature: round1(reading.temperature()),
            pressure: round1(reading.pressure()),
            humidity: round1(reading.humidity()),
            dew_point: round1(reading.dew_point()),
            lx: round1(reading.lux()),
            ambient_lux: round1(reading.ambient_lux()),
        }
    }
}

impl ReadingPayload {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
