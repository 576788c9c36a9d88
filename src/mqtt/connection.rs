//! Per-endpoint connection state machine
//!
//! ```text
//!                 connect ok            publish
//! Disconnected ──► Connecting ──► Connected ◄──► Publishing
//!      ▲               │              ▲              │
//!      └── connect err ┘              │        publish err
//!                                     │              ▼
//!                       ensure_connected ◄──── Reconnecting
//!
//! any state ── close() ──► Closed
//! ```
//!
//! The state is a plain runtime enum rather than a typestate: a tick needs to
//! hold all connections in one `Vec` whatever state each of them is in.

use std::fmt;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::transport::{BrokerTransport, TransportError};
use crate::config::{BrokerConfig, EndpointId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Publishing,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Upper bounds for the blocking transport calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub publish: Duration,
    pub close: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            publish: Duration::from_secs(5),
            close: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Connecting to {endpoint} failed: {source}")]
    Transport {
        endpoint: EndpointId,
        source: TransportError,
    },

    #[error("Connecting to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: EndpointId, after: Duration },

    #[error("Connection to {0} is closed")]
    Closed(EndpointId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("{endpoint} is not connected (state {state})")]
    NotConnected {
        endpoint: EndpointId,
        state: ConnectionState,
    },

    #[error("Publishing to {endpoint} failed: {source}")]
    Transport {
        endpoint: EndpointId,
        source: TransportError,
    },

    #[error("Publishing to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: EndpointId, after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseError {
    #[error("Closing {endpoint} failed: {source}")]
    Transport {
        endpoint: EndpointId,
        source: TransportError,
    },

    #[error("Closing {endpoint} timed out after {after:?}")]
    Timeout { endpoint: EndpointId, after: Duration },
}

/// Owns the session to exactly one broker
pub struct BrokerConnection {
    broker: BrokerConfig,
    endpoint: EndpointId,
    client_id: String,
    transport: Box<dyn BrokerTransport>,
    state: ConnectionState,
    timeouts: ConnectionTimeouts,
}

impl BrokerConnection {
    pub fn new(
        broker: BrokerConfig,
        transport: Box<dyn BrokerTransport>,
        client_id_base: &str,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        let client_id = format!("{}{}", client_id_base, broker.host);
        let endpoint = broker.id();
        Self {
            broker,
            endpoint,
            client_id,
            transport,
            state: ConnectionState::Disconnected,
            timeouts,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Opens a fresh session
    ///
    /// On failure the connection is left `Disconnected` and the error is
    /// returned to the caller; nothing is retried here.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectError::Closed(self.endpoint.clone()));
        }

        self.state = ConnectionState::Connecting;
        debug!("Connecting to {} as {}", self.endpoint, self.client_id);

        let attempt = timeout(
            self.timeouts.connect,
            self.transport.connect(&self.broker, &self.client_id),
        )
        .await;

        match attempt {
            Ok(Ok(())) => {
                self.state = ConnectionState::Connected;
                info!("{} connected", self.endpoint);
                Ok(())
            }
            Ok(Err(source)) => {
                self.state = ConnectionState::Disconnected;
                Err(ConnectError::Transport {
                    endpoint: self.endpoint.clone(),
                    source,
                })
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                Err(ConnectError::Timeout {
                    endpoint: self.endpoint.clone(),
                    after: self.timeouts.connect,
                })
            }
        }
    }

    /// Makes one fresh connection attempt unless already connected
    pub async fn ensure_connected(&mut self) -> Result<(), ConnectError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(ConnectError::Closed(self.endpoint.clone())),
            ConnectionState::Reconnecting => {
                info!("Reconnecting to {}", self.endpoint);
                self.connect().await
            }
            _ => self.connect().await,
        }
    }

    /// Sends one payload; requires `Connected`
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if self.state != ConnectionState::Connected {
            return Err(PublishError::NotConnected {
                endpoint: self.endpoint.clone(),
                state: self.state,
            });
        }

        self.state = ConnectionState::Publishing;
        let attempt = timeout(self.timeouts.publish, self.transport.publish(topic, payload)).await;

        match attempt {
            Ok(Ok(())) => {
                self.state = ConnectionState::Connected;
                debug!("Published {} bytes to {} on {}", payload.len(), self.endpoint, topic);
                Ok(())
            }
            Ok(Err(source)) => {
                self.state = ConnectionState::Reconnecting;
                Err(PublishError::Transport {
                    endpoint: self.endpoint.clone(),
                    source,
                })
            }
            Err(_) => {
                self.state = ConnectionState::Reconnecting;
                Err(PublishError::Timeout {
                    endpoint: self.endpoint.clone(),
                    after: self.timeouts.publish,
                })
            }
        }
    }

    /// Ends the session; idempotent, the connection is `Closed` afterwards
    /// even when the transport reports an error
    pub async fn close(&mut self) -> Result<(), CloseError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        let attempt = timeout(self.timeouts.close, self.transport.disconnect()).await;
        self.state = ConnectionState::Closed;

        match attempt {
            Ok(Ok(())) => {
                info!("{} closed", self.endpoint);
                Ok(())
            }
            Ok(Err(source)) => {
                warn!("Closing {} reported an error: {}", self.endpoint, source);
                Err(CloseError::Transport {
                    endpoint: self.endpoint.clone(),
                    source,
                })
            }
            Err(_) => Err(CloseError::Timeout {
                endpoint: self.endpoint.clone(),
                after: self.timeouts.close,
            }),
        }
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish()
    }
}
