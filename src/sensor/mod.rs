//! Sensor boundary
//!
//! The scheduler only sees [`SensorPort`]: one synchronous call that returns a
//! [`RawSample`] or a [`SensorError`]. The Raspberry Pi implementation lives in
//! [`board`] and talks to two I2C parts:
//!
//! ```text
//! sensor/
//! ├── bme280.rs  - temperature, pressure, humidity
//! ├── bh1745.rs  - colour / clear light channel
//! └── board.rs   - both chips behind one SensorPort, lux derivation
//! ```

pub mod bh1745;
pub mod bme280;
pub mod board;

use std::sync::{Arc, Mutex};

use crate::reading::RawSample;

/// Errors raised by a single sensor read
///
/// All of them are per-tick: the scheduler skips the tick and carries on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SensorError {
    /// Bus level failure while talking to a chip
    #[error("I2C error on {device}: {reason}")]
    Bus { device: &'static str, reason: String },

    /// A chip answered with an unexpected identity
    #[error("Unexpected chip id on {device}: {found:#04x}")]
    WrongChip { device: &'static str, found: u8 },

    /// The sample is a known bad value and must not be published
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// The read did not finish within the sensor timeout
    #[error("Sensor read timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The blocking read task died
    #[error("Sensor task failed: {0}")]
    TaskFailed(String),
}

/// Port for acquiring one raw sample
///
/// Implementations may block on hardware I/O; callers run them on the blocking
/// pool.
pub trait SensorPort: Send {
    fn read_raw(&mut self) -> Result<RawSample, SensorError>;
}

/// Sensor handle shared with the blocking thread pool for the duration of a read
pub type SharedSensor = Arc<Mutex<Box<dyn SensorPort>>>;

pub fn shared(sensor: impl SensorPort + 'static) -> SharedSensor {
    Arc::new(Mutex::new(Box::new(sensor)))
}
