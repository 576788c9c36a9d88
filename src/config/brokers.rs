//! Broker list parsing
//!
//! The list is a JSON array of objects. Older deployments wrote it with a
//! Python object tag and long field names:
//!
//! ```json
//! [{"py/object": "__main__.broker", "brokerfqdn": "mqtt.local", "brokerport": 1883,
//!   "brokerusername": "", "brokerpassword": ""}]
//! ```
//!
//! Both shapes are accepted. The tag is dropped, every other unknown key is an
//! error.

use serde::Deserialize;

use super::{BrokerConfig, ConfigError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BrokerEntry {
    #[serde(rename = "py/object", default)]
    _legacy_tag: Option<serde_json::Value>,
    #[serde(alias = "brokerfqdn")]
    host: String,
    #[serde(alias = "brokerport")]
    port: serde_json::Number,
    #[serde(alias = "brokerusername", default)]
    username: Option<String>,
    #[serde(alias = "brokerpassword", default)]
    password: Option<String>,
}

/// Parses and validates the broker list
///
/// Validation covers shape, non-empty list, non-empty host and the port range.
pub fn parse_broker_list(json: &str) -> Result<Vec<BrokerConfig>, ConfigError> {
    let entries: Vec<BrokerEntry> =
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidBrokerList(e.to_string()))?;

    if entries.is_empty() {
        return Err(ConfigError::EmptyBrokerList);
    }

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| entry.into_config(index))
        .collect()
}

impl BrokerEntry {
    fn into_config(self, index: usize) -> Result<BrokerConfig, ConfigError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::InvalidBrokerList(format!(
                "broker #{index} has an empty host"
            )));
        }

        let port = self
            .port
            .as_u64()
            .filter(|p| (1..=u16::MAX as u64).contains(p))
            .ok_or_else(|| ConfigError::InvalidPort {
                index,
                host: host.clone(),
                port: self.port.to_string(),
            })? as u16;

        Ok(BrokerConfig {
            host,
            port,
            username: non_empty(self.username),
            password: non_empty(self.password),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
