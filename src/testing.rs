//! Hand-written collaborators for unit tests
//!
//! Each mock is cheap to clone and shares its state, so a test keeps one
//! handle to steer and inspect while the code under test owns the boxed copy.
//! All of them write into an [`EventLog`] so ordering across components can be
//! asserted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::BrokerConfig;
use crate::mqtt::{BrokerTransport, TransportError};
use crate::persistence::{ReadingStore, StoreError};
use crate::reading::{RawSample, Reading};
use crate::sensor::{SensorError, SensorPort};

/// A plausible sample with the given temperature
pub fn raw_sample(temperature: f64) -> RawSample {
    RawSample {
        captured_at: Utc::now(),
        temperature,
        pressure: 1013.25,
        humidity: 55.0,
        lux: 1200.0,
        ambient_lux: 1200.0,
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == event)
    }
}

struct SensorScript {
    queued: VecDeque<Result<RawSample, SensorError>>,
    fallback: Result<RawSample, SensorError>,
    delay: Duration,
    reads: usize,
}

#[derive(Clone)]
pub struct MockSensor {
    script: Arc<Mutex<SensorScript>>,
    events: EventLog,
}

impl MockSensor {
    /// Returns `fallback` whenever nothing is queued
    pub fn new(fallback: RawSample, events: EventLog) -> Self {
        Self {
            script: Arc::new(Mutex::new(SensorScript {
                queued: VecDeque::new(),
                fallback: Ok(fallback),
                delay: Duration::ZERO,
                reads: 0,
            })),
            events,
        }
    }

    pub fn failing(error: SensorError, events: EventLog) -> Self {
        let sensor = Self::new(raw_sample(20.0), events);
        sensor.script.lock().unwrap().fallback = Err(error);
        sensor
    }

    pub fn push(&self, result: Result<RawSample, SensorError>) {
        self.script.lock().unwrap().queued.push_back(result);
    }

    pub fn delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = delay;
    }

    pub fn reads(&self) -> usize {
        self.script.lock().unwrap().reads
    }
}

impl SensorPort for MockSensor {
    fn read_raw(&mut self) -> Result<RawSample, SensorError> {
        let (result, delay) = {
            let mut script = self.script.lock().unwrap();
            script.reads += 1;
            let result = script
                .queued
                .pop_front()
                .unwrap_or_else(|| script.fallback.clone());
            (result, script.delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.events.push("sensor read");
        result
    }
}

#[derive(Default)]
struct TransportScript {
    refuse_connect: bool,
    hang_connect: bool,
    fail_publish: bool,
    publish_delay: Duration,
    fail_disconnect: bool,
    hang_disconnect: bool,
    connects: usize,
    published: Vec<(String, Vec<u8>)>,
}

#[derive(Clone)]
pub struct MockTransport {
    label: String,
    script: Arc<Mutex<TransportScript>>,
    events: EventLog,
}

impl MockTransport {
    pub fn new(label: &str, events: EventLog) -> Self {
        Self {
            label: label.to_string(),
            script: Arc::default(),
            events,
        }
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.script.lock().unwrap().refuse_connect = refuse;
    }

    pub fn hang_connect(&self, hang: bool) {
        self.script.lock().unwrap().hang_connect = hang;
    }

    pub fn fail_publish(&self, fail: bool) {
        self.script.lock().unwrap().fail_publish = fail;
    }

    pub fn publish_delay(&self, delay: Duration) {
        self.script.lock().unwrap().publish_delay = delay;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.script.lock().unwrap().fail_disconnect = fail;
    }

    pub fn hang_disconnect(&self, hang: bool) {
        self.script.lock().unwrap().hang_disconnect = hang;
    }

    pub fn connects(&self) -> usize {
        self.script.lock().unwrap().connects
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.script.lock().unwrap().published.clone()
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(
        &mut self,
        _broker: &BrokerConfig,
        _client_id: &str,
    ) -> Result<(), TransportError> {
        self.events.push(format!("connect {}", self.label));
        let (refuse, hang) = {
            let script = self.script.lock().unwrap();
            (script.refuse_connect, script.hang_connect)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if refuse {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        self.script.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let (fail, delay) = {
            let script = self.script.lock().unwrap();
            (script.fail_publish, script.publish_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            self.events.push(format!("publish failed {}", self.label));
            return Err(TransportError::Network("broken pipe".to_string()));
        }
        self.script
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), payload.to_vec()));
        self.events.push(format!("publish {}", self.label));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let (fail, hang) = {
            let script = self.script.lock().unwrap();
            (script.fail_disconnect, script.hang_disconnect)
        };
        if hang {
            self.events.push(format!("disconnect hung {}", self.label));
            std::future::pending::<()>().await;
        }
        if fail {
            self.events.push(format!("disconnect failed {}", self.label));
            return Err(TransportError::Client("request channel closed".to_string()));
        }
        self.events.push(format!("disconnect {}", self.label));
        Ok(())
    }
}

#[derive(Default)]
struct StoreScript {
    fail_connect: bool,
    fail_insert: bool,
    insert_delay: Duration,
    connects: usize,
    rows: Vec<Reading>,
}

#[derive(Clone)]
pub struct MockStore {
    script: Arc<Mutex<StoreScript>>,
    events: EventLog,
}

impl MockStore {
    pub fn new(events: EventLog) -> Self {
        Self {
            script: Arc::default(),
            events,
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.script.lock().unwrap().fail_connect = fail;
    }

    pub fn fail_insert(&self, fail: bool) {
        self.script.lock().unwrap().fail_insert = fail;
    }

    pub fn insert_delay(&self, delay: Duration) {
        self.script.lock().unwrap().insert_delay = delay;
    }

    pub fn connects(&self) -> usize {
        self.script.lock().unwrap().connects
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.script.lock().unwrap().rows.clone()
    }
}

#[async_trait]
impl ReadingStore for MockStore {
    async fn connect(&mut self) -> Result<(), StoreError> {
        self.events.push("store connect");
        let mut script = self.script.lock().unwrap();
        if script.fail_connect {
            return Err(StoreError::Connect("access denied".to_string()));
        }
        script.connects += 1;
        Ok(())
    }

    async fn insert_reading(&mut self, reading: &Reading) -> Result<(), StoreError> {
        let (fail, delay) = {
            let script = self.script.lock().unwrap();
            (script.fail_insert, script.insert_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            self.events.push("store insert failed");
            return Err(StoreError::Query("server has gone away".to_string()));
        }
        self.script.lock().unwrap().rows.push(*reading);
        self.events.push("store insert");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.events.push("store close");
        Ok(())
    }
}
