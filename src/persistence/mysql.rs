//! MySQL store
//!
//! Writes to the `Readings` table:
//!
//! ```sql
//! INSERT INTO Readings (Humidity, Pressure, Temperature, Lux, AmbientLux)
//! VALUES (?, ?, ?, ?, ?)
//! ```
//!
//! Values are rounded to one decimal, the same figures that go out over MQTT.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::debug;

use super::{ReadingStore, StoreError};
use crate::config::PersistenceConfig;
use crate::reading::{round1, Reading};

const INSERT_READING: &str =
    "INSERT INTO Readings (Humidity, Pressure, Temperature, Lux, AmbientLux) VALUES (?, ?, ?, ?, ?)";

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MySqlStore {
    config: PersistenceConfig,
    pool: Option<MySqlPool>,
}

impl MySqlStore {
    pub fn new(config: PersistenceConfig) -> Self {
        Self { config, pool: None }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        let (host, port) = split_server(&self.config.server);
        let options = MySqlConnectOptions::new()
            .host(host)
            .database(&self.config.name)
            .username(&self.config.username)
            .password(&self.config.password);
        match port {
            Some(port) => options.port(port),
            None => options,
        }
    }
}

/// `host` or `host:port`
fn split_server(server: &str) -> (&str, Option<u16>) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (server, None),
        },
        None => (server, None),
    }
}

#[async_trait]
impl ReadingStore for MySqlStore {
    async fn connect(&mut self) -> Result<(), StoreError> {
        if let Some(old) = self.pool.take() {
            old.close().await;
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(self.connect_options())
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        debug!("Connected to database {} on {}", self.config.name, self.config.server);
        self.pool = Some(pool);
        Ok(())
    }

    async fn insert_reading(&mut self, reading: &Reading) -> Result<(), StoreError> {
        let pool = self.pool.as_ref().ok_or(StoreError::NotConnected)?;

        sqlx::query(INSERT_READING)
            .bind(round1(reading.humidity()))
            .bind(round1(reading.pressure()))
            .bind(round1(reading.temperature()))
            .bind(round1(reading.lux()))
            .bind(round1(reading.ambient_lux()))
            .execute(pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{calibrate, CalibrationOffsets};
    use crate::testing::raw_sample;

    fn store() -> MySqlStore {
        MySqlStore::new(PersistenceConfig {
            server: "db.local".into(),
            name: "weather".into(),
            username: "pi".into(),
            password: "secret".into(),
        })
    }

    #[test]
    fn server_may_carry_a_port() {
        assert_eq!(split_server("db.local"), ("db.local", None));
        assert_eq!(split_server("db.local:3307"), ("db.local", Some(3307)));
        assert_eq!(split_server("db.local:abc"), ("db.local:abc", None));
    }

    #[tokio::test]
    async fn insert_without_session_is_rejected() {
        let mut store = store();
        let reading = calibrate(&raw_sample(20.0), &CalibrationOffsets::default());
        assert_eq!(
            store.insert_reading(&reading).await,
            Err(StoreError::NotConnected)
        );
    }

    #[tokio::test]
    async fn close_without_session_is_fine() {
        assert_eq!(store().close().await, Ok(()));
    }
}
