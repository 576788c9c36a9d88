//! Tick scheduler with statum state machine
//!
//! Drives the timed loop and owns every connection and the persistence writer.
//!
//! # State Machine
//!
//! ```text
//! Starting ──► Running ──► Draining ──► Stopped
//!   (connect)    (ticks)     (close all)
//! ```
//!
//! # One tick
//!
//! ```text
//! SensorPort ──► calibrate ──► fan-out (broker 1..n) ──► persistence
//!  (blocking pool,               (sequential,             (optional)
//!   timeout)                      isolated failures)
//! ```
//!
//! The next tick starts `refresh_interval` after the previous one finished, so
//! ticks never overlap. A shutdown request between ticks goes straight to
//! `Draining`. A request during a tick lets that tick finish; only when the
//! drain deadline passes is the tick abandoned.

pub mod shutdown;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, BrokerConfig};
use crate::mqtt::{self, BrokerConnection, BrokerTransport, ConnectionTimeouts, FanoutResult};
use crate::persistence::{PersistenceWriter, ReadingStore, WriteError};
use crate::reading::{calibrate, RawSample};
use crate::sensor::{SensorError, SharedSensor};
pub use shutdown::Shutdown;

/// Loop statistics are logged every this many ticks
const STATS_EVERY: u64 = 12;

/// Upper bounds for every blocking step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub sensor: Duration,
    pub connect: Duration,
    pub publish: Duration,
    pub write: Duration,
    pub close: Duration,
    /// Grace period after a shutdown request
    pub drain: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sensor: Duration::from_secs(5),
            connect: Duration::from_secs(10),
            publish: Duration::from_secs(5),
            write: Duration::from_secs(10),
            close: Duration::from_secs(3),
            drain: Duration::from_secs(20),
        }
    }
}

impl Timeouts {
    pub fn connection(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: self.connect,
            publish: self.publish,
            close: self.close,
        }
    }
}

/// What happened in one tick
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// The sensor failed; nothing was published or stored
    Skipped(SensorError),
    Completed {
        fanout: FanoutResult,
        /// `None` when persistence is disabled
        persisted: Option<Result<(), WriteError>>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub skipped: u64,
    pub partial_fanouts: u64,
    pub persistence_failures: u64,
}

impl TickStats {
    fn record(&mut self, outcome: &TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Skipped(_) => self.skipped += 1,
            TickOutcome::Completed { fanout, persisted } => {
                if !fanout.is_complete() {
                    self.partial_fanouts += 1;
                }
                if matches!(persisted, Some(Err(_))) {
                    self.persistence_failures += 1;
                }
            }
        }
    }
}

impl fmt::Display for TickStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ticks, {} skipped, {} partial fan-outs, {} persistence failures",
            self.ticks, self.skipped, self.partial_fanouts, self.persistence_failures
        )
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SchedulerState {
    Starting, // Connections built, nothing opened yet
    Running,  // Ticking
    Draining, // Shutdown requested, closing sessions
    Stopped,  // Terminal
}

#[machine]
pub struct TickScheduler<S: SchedulerState> {
    config: Arc<AppConfig>,
    sensor: SharedSensor,
    connections: Vec<BrokerConnection>,
    writer: Option<PersistenceWriter>,
    timeouts: Timeouts,
    shutdown: Shutdown,
    stats: TickStats,
}

impl<S: SchedulerState> TickScheduler<S> {
    pub fn stats(&self) -> TickStats {
        self.stats
    }

    #[cfg(test)]
    pub fn connections(&self) -> &[BrokerConnection] {
        &self.connections
    }
}

impl TickScheduler<Starting> {
    /// Builds one connection per configured broker and the optional writer
    ///
    /// `transport_for` is called once per broker in configured order.
    pub fn create<F>(
        config: Arc<AppConfig>,
        sensor: SharedSensor,
        store: Option<Box<dyn ReadingStore>>,
        mut transport_for: F,
        client_id_base: &str,
        timeouts: Timeouts,
        shutdown: Shutdown,
    ) -> Self
    where
        F: FnMut(&BrokerConfig) -> Box<dyn BrokerTransport>,
    {
        let connections = config
            .brokers
            .iter()
            .map(|broker| {
                BrokerConnection::new(
                    broker.clone(),
                    transport_for(broker),
                    client_id_base,
                    timeouts.connection(),
                )
            })
            .collect::<Vec<_>>();

        let writer = store.map(|store| PersistenceWriter::new(store, timeouts.write, timeouts.close));

        info!(
            "Scheduler created: {} broker(s), persistence {}, refresh every {:?}",
            connections.len(),
            if writer.is_some() { "on" } else { "off" },
            config.refresh_interval
        );

        Self::new(
            config,
            sensor,
            connections,
            writer,
            timeouts,
            shutdown,
            TickStats::default(),
        )
    }

    /// Attempts the initial connect on every broker
    ///
    /// Failures are logged and left to the first tick's `ensure_connected`.
    pub async fn start(mut self) -> TickScheduler<Running> {
        for connection in self.connections.iter_mut() {
            if let Err(e) = connection.connect().await {
                warn!("Initial connect failed, retrying on the next tick: {}", e);
            }
        }
        info!("Scheduler running");
        self.transition()
    }
}

impl TickScheduler<Running> {
    /// Runs one read-calibrate-publish-persist cycle
    pub async fn tick(&mut self) -> TickOutcome {
        let tick = self.stats.ticks + 1;

        let outcome = match read_sensor(&self.sensor, self.timeouts.sensor).await {
            Err(e) => {
                warn!("Tick {}: sensor read failed, skipping: {}", tick, e);
                TickOutcome::Skipped(e)
            }
            Ok(raw) => {
                let reading = calibrate(&raw, &self.config.calibration);
                debug!("Tick {}: {:?}", tick, reading);

                let fanout =
                    mqtt::publish(&reading, &self.config.topic_prefix, &mut self.connections)
                        .await;
                if fanout.is_complete() {
                    info!(
                        "Tick {}: published to {} broker(s)",
                        tick,
                        fanout.succeeded()
                    );
                } else {
                    warn!(
                        "Tick {}: published to {} of {} broker(s)",
                        tick,
                        fanout.succeeded(),
                        fanout.outcomes().len()
                    );
                }

                let persisted = match self.writer.as_mut() {
                    Some(writer) => {
                        let result = writer.write(&reading).await;
                        if let Err(e) = &result {
                            error!("Tick {}: {}", tick, e);
                        }
                        Some(result)
                    }
                    None => None,
                };

                TickOutcome::Completed { fanout, persisted }
            }
        };

        self.stats.record(&outcome);
        if self.stats.ticks % STATS_EVERY == 0 {
            info!("Loop statistics: {}", self.stats);
        }
        outcome
    }

    /// Ticks until shutdown is requested
    ///
    /// The first tick runs immediately. A tick in flight when the request
    /// arrives is allowed to finish unless the drain deadline passes first.
    pub async fn run_until_shutdown(mut self) -> TickScheduler<Draining> {
        let shutdown = self.shutdown.clone();
        let drain = self.timeouts.drain;

        while !shutdown.is_requested() {
            let finished = tokio::select! {
                biased;
                _ = self.tick() => true,
                _ = drain_deadline_passed(&shutdown, drain) => false,
            };
            if !finished {
                warn!("Drain deadline passed during a tick, abandoning it");
                break;
            }

            tokio::select! {
                _ = shutdown.requested() => {}
                _ = sleep(self.config.refresh_interval) => {}
            }
        }

        info!("Shutdown requested, draining");
        self.transition()
    }
}

impl TickScheduler<Draining> {
    /// Closes every broker connection and the writer within the drain deadline
    ///
    /// Whatever is still open when the deadline passes is dropped.
    pub async fn drain(mut self) -> TickScheduler<Stopped> {
        let deadline = self.shutdown.requested_at().unwrap_or_else(Instant::now) + self.timeouts.drain;

        for connection in self.connections.iter_mut() {
            match timeout_at(deadline, connection.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}", e),
                Err(_) => {
                    warn!(
                        "Drain deadline passed while closing {}, dropping remaining sessions",
                        connection.endpoint()
                    );
                    break;
                }
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            match timeout_at(deadline, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Closing the persistence writer failed: {}", e),
                Err(_) => warn!("Drain deadline passed before the database session was closed"),
            }
        }

        info!("Final loop statistics: {}", self.stats);
        self.connections.clear();
        self.writer = None;
        self.transition()
    }
}

impl TickScheduler<Stopped> {}

/// Completes once shutdown was requested and the drain period has elapsed
async fn drain_deadline_passed(shutdown: &Shutdown, drain: Duration) {
    shutdown.requested().await;
    let requested_at = shutdown.requested_at().unwrap_or_else(Instant::now);
    sleep_until(requested_at + drain).await;
}

/// Reads the sensor on the blocking pool, bounded by `limit`
async fn read_sensor(sensor: &SharedSensor, limit: Duration) -> Result<RawSample, SensorError> {
    let sensor = Arc::clone(sensor);
    let task = tokio::task::spawn_blocking(move || {
        let mut sensor = sensor
            .lock()
            .map_err(|_| SensorError::TaskFailed("sensor lock poisoned".to_string()))?;
        sensor.read_raw()
    });

    match timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(SensorError::TaskFailed(join_error.to_string())),
        Err(_) => Err(SensorError::Timeout(limit)),
    }
}
