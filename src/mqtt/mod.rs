//! # MQTT publishing
//!
//! Every configured broker gets its own [`BrokerConnection`]. Connections share
//! nothing: a broker that is down only affects its own entry in the
//! [`FanoutResult`] of a tick.
//!
//! ```text
//! mqtt/
//! ├── transport.rs   - BrokerTransport trait, rumqttc implementation
//! ├── connection.rs  - per-endpoint state machine with timeouts
//! └── fanout.rs      - one reading to all endpoints, in configured order
//! ```
//!
//! ## Reconnects
//!
//! A failed connect or publish leaves the connection in `Disconnected` or
//! `Reconnecting`. Nothing is retried inside the failing tick. The next tick
//! calls [`BrokerConnection::ensure_connected`] which opens one fresh session.

pub mod connection;
pub mod fanout;
pub mod transport;

pub use connection::{
    BrokerConnection, CloseError, ConnectError, ConnectionState, ConnectionTimeouts, PublishError,
};
pub use fanout::{publish, EndpointFailure, EndpointOutcome, FanoutResult};
pub use transport::{BrokerTransport, MqttTransport, TransportError};

/// Per-process client id stem: `<hostname>_s-<0..=1000>`
///
/// Each connection appends its broker host, so one process never shows up
/// twice on the same broker and two stations rarely collide.
pub fn client_id_base() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "weatherpi".to_string());
    format!("{}_s-{}", host, rand::random_range(0..=1000u32))
}
