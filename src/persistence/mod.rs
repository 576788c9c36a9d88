//! # Reading persistence
//!
//! Optional second sink next to the brokers. It only exists when persistence
//! is enabled in the configuration, and its outcome never influences the
//! fan-out or the schedule.
//!
//! ```text
//! persistence/
//! ├── mod.rs    - ReadingStore trait, PersistenceWriter (timeouts, lazy reconnect)
//! └── mysql.rs  - sqlx MySQL store
//! ```
//!
//! The writer connects on the first write. After a failed insert the session
//! is dropped and the next write opens a new one; nothing is retried within
//! the same tick.

pub mod mysql;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::reading::Reading;

pub use mysql::MySqlStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database connection failed: {0}")]
    Connect(String),

    #[error("Database insert failed: {0}")]
    Query(String),

    #[error("No database session")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Database write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Writer is closed")]
    Closed,
}

/// A database that accepts one reading per call
#[async_trait]
pub trait ReadingStore: Send {
    async fn connect(&mut self) -> Result<(), StoreError>;

    async fn insert_reading(&mut self, reading: &Reading) -> Result<(), StoreError>;

    async fn close(&mut self) -> Result<(), StoreError>;
}

/// Wraps a [`ReadingStore`] with session handling and timeouts
pub struct PersistenceWriter {
    store: Box<dyn ReadingStore>,
    connected: bool,
    closed: bool,
    write_timeout: Duration,
    close_timeout: Duration,
}

impl PersistenceWriter {
    pub fn new(store: Box<dyn ReadingStore>, write_timeout: Duration, close_timeout: Duration) -> Self {
        Self {
            store,
            connected: false,
            closed: false,
            write_timeout,
            close_timeout,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Inserts one reading, connecting first if there is no session
    ///
    /// Connect and insert share one timeout.
    pub async fn write(&mut self, reading: &Reading) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }

        let attempt = timeout(self.write_timeout, self.connect_and_insert(reading)).await;
        let result = match attempt {
            Ok(result) => result.map_err(WriteError::from),
            Err(_) => Err(WriteError::Timeout(self.write_timeout)),
        };

        if result.is_err() && self.connected {
            self.drop_session().await;
        }
        result
    }

    async fn connect_and_insert(&mut self, reading: &Reading) -> Result<(), StoreError> {
        if !self.connected {
            self.store.connect().await?;
            self.connected = true;
            info!("Database session opened");
        }
        self.store.insert_reading(reading).await
    }

    async fn drop_session(&mut self) {
        debug!("Dropping database session after a failed write");
        match timeout(self.close_timeout, self.store.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing the broken session failed: {}", e),
            Err(_) => debug!("Closing the broken session timed out"),
        }
        self.connected = false;
    }

    /// Closes the session; idempotent
    pub async fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        match timeout(self.close_timeout, self.store.close()).await {
            Ok(Ok(())) => {
                info!("Database session closed");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Closing the database session failed: {}", e);
                Err(WriteError::Store(e))
            }
            Err(_) => Err(WriteError::Timeout(self.close_timeout)),
        }
    }
}
