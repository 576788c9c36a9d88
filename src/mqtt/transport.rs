//! Message bus transport
//!
//! [`BrokerTransport`] is the seam between the connection state machine and
//! the network. [`MqttTransport`] implements it with `rumqttc`: the client
//! half is kept for publishing and a driver task polls the event loop and
//! reports the link state through a `watch` channel.
//!
//! ```text
//! MqttTransport ──publish──► AsyncClient ──► EventLoop ◄── driver task
//!       ▲                                                      │
//!       └──────────────── watch<LinkState> ◄───────────────────┘
//! ```
//!
//! The driver stops at the first network error instead of letting rumqttc
//! reconnect on its own. Reconnects belong to the owning connection.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

pub const TLS_PORT: u16 = 8883;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No open session")]
    NotConnected,

    #[error("Client request failed: {0}")]
    Client(String),
}

/// Low-level operations against one broker
///
/// Calls are not bounded in time here; [`super::BrokerConnection`] wraps each
/// of them in a timeout.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Opens a fresh session, replacing any previous one
    async fn connect(&mut self, broker: &BrokerConfig, client_id: &str)
        -> Result<(), TransportError>;

    /// Sends one message with at-most-once delivery
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Ends the session. Calling it without a session is not an error.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Up,
    Down(String),
    Refused(String),
    Closed,
}

struct Session {
    client: AsyncClient,
    link: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// `rumqttc` backed transport
#[derive(Default)]
pub struct MqttTransport {
    session: Option<Session>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(broker: &BrokerConfig, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);

        if let Some(username) = &broker.username {
            options.set_credentials(
                username.clone(),
                broker.password.clone().unwrap_or_default(),
            );
        }
        if broker.port == TLS_PORT {
            debug!("Using TLS for {}:{}", broker.host, broker.port);
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.driver.abort();
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.drop_session();
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(
        &mut self,
        broker: &BrokerConfig,
        client_id: &str,
    ) -> Result<(), TransportError> {
        self.drop_session();

        let (client, event_loop) =
            AsyncClient::new(Self::options(broker, client_id), REQUEST_CAPACITY);
        let (link_tx, mut link) = watch::channel(LinkState::Connecting);
        let cancel = CancellationToken::new();
        let endpoint = broker.id().to_string();
        let driver = tokio::spawn(drive(endpoint, event_loop, link_tx, cancel.clone()));

        self.session = Some(Session {
            client,
            link: link.clone(),
            cancel,
            driver,
        });

        let settled = link
            .wait_for(|state| *state != LinkState::Connecting)
            .await
            .map(|state| state.clone())
            .map_err(|_| TransportError::Network("driver task ended".to_string()))?;

        match settled {
            LinkState::Up => Ok(()),
            LinkState::Refused(reason) => {
                self.drop_session();
                Err(TransportError::Refused(reason))
            }
            LinkState::Down(reason) => {
                self.drop_session();
                Err(TransportError::Network(reason))
            }
            LinkState::Closed | LinkState::Connecting => {
                self.drop_session();
                Err(TransportError::NotConnected)
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;

        let link = session.link.borrow().clone();
        match link {
            LinkState::Up => {}
            LinkState::Down(reason) => return Err(TransportError::Network(reason)),
            _ => return Err(TransportError::NotConnected),
        }

        session
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let was_up = *session.link.borrow() == LinkState::Up;
        let result = if was_up {
            session
                .client
                .disconnect()
                .await
                .map_err(|e| TransportError::Client(e.to_string()))
        } else {
            Ok(())
        };

        // Give the driver a moment to flush the DISCONNECT packet
        if tokio::time::timeout(DISCONNECT_FLUSH, &mut session.driver)
            .await
            .is_err()
        {
            debug!("Driver did not stop in time, aborting it");
        }
        session.cancel.cancel();
        session.driver.abort();
        result
    }
}

/// Polls the event loop until the session ends and mirrors it into `link`
async fn drive(
    endpoint: String,
    mut event_loop: EventLoop,
    link: watch::Sender<LinkState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                link.send_replace(LinkState::Closed);
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connected to MQTT broker {}", endpoint);
                        link.send_replace(LinkState::Up);
                    } else {
                        link.send_replace(LinkState::Refused(format!("{:?}", ack.code)));
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    link.send_replace(LinkState::Down("broker closed the session".to_string()));
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    link.send_replace(LinkState::Closed);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT event loop error on {}: {}", endpoint, e);
                    link.send_replace(LinkState::Down(e.to_string()));
                    break;
                }
            }
        }
    }
}
