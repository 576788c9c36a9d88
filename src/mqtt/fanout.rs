//! One reading, every broker
//!
//! The payload is serialised once and handed to each connection in configured
//! order. A failing endpoint is recorded in the [`FanoutResult`] and the loop
//! moves on to the next one.

use tracing::{debug, warn};

use super::connection::{BrokerConnection, ConnectError, PublishError};
use crate::config::EndpointId;
use crate::reading::payload::{weather_topic, ReadingPayload};
use crate::reading::Reading;

/// Why one endpoint did not receive the reading
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointFailure {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Payload serialisation failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOutcome {
    pub endpoint: EndpointId,
    pub result: Result<(), EndpointFailure>,
}

/// Per-endpoint outcome of one fan-out, in configured order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutResult {
    outcomes: Vec<EndpointOutcome>,
}

impl FanoutResult {
    pub fn outcomes(&self) -> &[EndpointOutcome] {
        &self.outcomes
    }

    pub fn get(&self, endpoint: &EndpointId) -> Option<&Result<(), EndpointFailure>> {
        self.outcomes
            .iter()
            .find(|o| &o.endpoint == endpoint)
            .map(|o| &o.result)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }
}

/// Publishes `reading` to `<topic_prefix>WeatherData` on every connection
///
/// A connection that is not up gets one `ensure_connected` attempt first.
/// Never fails as a whole.
pub async fn publish(
    reading: &Reading,
    topic_prefix: &str,
    connections: &mut [BrokerConnection],
) -> FanoutResult {
    let topic = weather_topic(topic_prefix);

    let payload = match ReadingPayload::from(reading).to_json() {
        Ok(bytes) => bytes,
        Err(e) => {
            let failure = EndpointFailure::Encode(e.to_string());
            warn!("Could not encode reading: {}", failure);
            return FanoutResult {
                outcomes: connections
                    .iter()
                    .map(|c| EndpointOutcome {
                        endpoint: c.endpoint().clone(),
                        result: Err(failure.clone()),
                    })
                    .collect(),
            };
        }
    };

    let mut outcomes = Vec::with_capacity(connections.len());
    for connection in connections.iter_mut() {
        let result = deliver(connection, &topic, &payload).await;
        match &result {
            Ok(()) => debug!("Reading delivered to {}", connection.endpoint()),
            Err(e) => warn!("Reading not delivered to {}: {}", connection.endpoint(), e),
        }
        outcomes.push(EndpointOutcome {
            endpoint: connection.endpoint().clone(),
            result,
        });
    }

    FanoutResult { outcomes }
}

async fn deliver(
    connection: &mut BrokerConnection,
    topic: &str,
    payload: &[u8],
) -> Result<(), EndpointFailure> {
    connection.ensure_connected().await?;
    connection.publish(topic, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::mqtt::connection::ConnectionTimeouts;
    use crate::reading::{calibrate, CalibrationOffsets};
    use crate::testing::{raw_sample, EventLog, MockTransport};

    fn connection_to(host: &str, transport: &MockTransport) -> BrokerConnection {
        BrokerConnection::new(
            BrokerConfig::new(host, 1883),
            Box::new(transport.clone()),
            "station_s-1",
            ConnectionTimeouts {
                connect: Duration::from_millis(200),
                publish: Duration::from_millis(200),
                close: Duration::from_millis(200),
            },
        )
    }

    fn reading(temperature: f64) -> Reading {
        calibrate(&raw_sample(temperature), &CalibrationOffsets::default())
    }

    #[tokio::test]
    async fn one_unreachable_broker_does_not_affect_the_other() {
        let events = EventLog::default();
        let a = MockTransport::new("a:1883", events.clone());
        let b = MockTransport::new("b:1883", events.clone());
        b.refuse_connect(true);
        let mut connections = vec![connection_to("a", &a), connection_to("b", &b)];

        let result = publish(&reading(20.0), "Weatherstation/", &mut connections).await;

        let a_id = BrokerConfig::new("a", 1883).id();
        let b_id = BrokerConfig::new("b", 1883).id();
        assert_eq!(result.get(&a_id), Some(&Ok(())));
        assert!(matches!(
            result.get(&b_id),
            Some(Err(EndpointFailure::Connect(_)))
        ));
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(a.published()[0].0, "Weatherstation/WeatherData");
    }

    #[tokio::test]
    async fn n_minus_one_successes() {
        let events = EventLog::default();
        let transports: Vec<MockTransport> = (0..4)
            .map(|i| MockTransport::new(&format!("h{i}:1883"), events.clone()))
            .collect();
        transports[2].fail_publish(true);
        let mut connections: Vec<BrokerConnection> = transports
            .iter()
            .enumerate()
            .map(|(i, t)| connection_to(&format!("h{i}"), t))
            .collect();

        let result = publish(&reading(20.0), "X/", &mut connections).await;

        assert_eq!(result.succeeded(), 3);
        assert_eq!(result.failed(), 1);
        assert!(result.outcomes()[2].result.is_err());
        assert!(!result.is_complete());
    }

    #[tokio::test]
    async fn endpoints_are_tried_in_configured_order() {
        let events = EventLog::default();
        let a = MockTransport::new("a:1883", events.clone());
        let b = MockTransport::new("b:1883", events.clone());
        let mut connections = vec![connection_to("a", &a), connection_to("b", &b)];

        publish(&reading(20.0), "X/", &mut connections).await;

        assert_eq!(
            events.entries(),
            vec![
                "connect a:1883",
                "publish a:1883",
                "connect b:1883",
                "publish b:1883"
            ]
        );
    }

    #[tokio::test]
    async fn every_endpoint_gets_the_same_payload() {
        let events = EventLog::default();
        let a = MockTransport::new("a:1883", events.clone());
        let b = MockTransport::new("b:1883", events.clone());
        let mut connections = vec![connection_to("a", &a), connection_to("b", &b)];

        publish(&reading(21.37), "X/", &mut connections).await;

        let payload_a = &a.published()[0].1;
        let payload_b = &b.published()[0].1;
        assert_eq!(payload_a, payload_b);
        let json: serde_json::Value = serde_json::from_slice(payload_a).unwrap();
        assert_eq!(json["temperature"], 21.4);
    }

    #[tokio::test]
    async fn empty_connection_list_yields_empty_result() {
        let result = publish(&reading(20.0), "X/", &mut []).await;
        assert!(result.outcomes().is_empty());
        assert!(result.is_complete());
    }
}
