//! # Configuration resolution
//!
//! Builds the immutable [`AppConfig`] once at startup from two sources:
//!
//! ```text
//! environment ──┐
//!               ├──► resolve() ──► AppConfig (Arc, read-only) ──► scheduler
//! readings.toml ┘
//! ```
//!
//! Precedence is per setting: an environment value wins, otherwise the file
//! value, otherwise the default. A deployment can set `MQTT_TOPIC` in the
//! environment and keep the broker credentials in the file.
//!
//! Resolution fails closed. Any malformed or missing required value is a
//! [`ConfigError`] and nothing is handed to the scheduler.

pub mod brokers;
pub mod sources;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::reading::CalibrationOffsets;
#[cfg(test)]
pub use sources::EnvMap;
pub use sources::{ConfigFile, ProcessEnv, Setting, SettingsSource, SourceKind};

pub const DEFAULT_TOPIC_PREFIX: &str = "Weatherstation/";
pub const DEFAULT_REFRESH_SECS: u64 = 300;

/// Errors raised while resolving configuration
///
/// All of them are fatal and happen before the first tick.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("MQTT_BROKERS is not set and no broker list was found in the config file")]
    MissingBrokers,

    #[error("Invalid broker list: {0}")]
    InvalidBrokerList(String),

    #[error("Broker list is empty")]
    EmptyBrokerList,

    #[error("Broker #{index} ({host}) has port {port}, expected 1-65535")]
    InvalidPort {
        index: usize,
        host: String,
        port: String,
    },

    #[error("Refresh interval must be a positive number of seconds, got '{0}'")]
    InvalidRefresh(String),

    #[error("{setting} expects true/false/yes/no/1/0, got '{value}'")]
    InvalidBool { setting: Setting, value: String },

    #[error("{setting} expects a number, got '{value}'")]
    InvalidNumber { setting: Setting, value: String },

    #[error("Persistence is enabled but {0} is empty")]
    MissingPersistenceField(Setting),

    #[error("Could not read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not parse config file {path}: {reason}")]
    FileParse { path: PathBuf, reason: String },
}

/// `host:port` pair identifying one broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One message-bus endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn id(&self) -> EndpointId {
        EndpointId {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

// Hand-written so passwords never reach the logs
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Connection parameters for the optional reading store
#[derive(Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub server: String,
    pub name: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PersistenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceConfig")
            .field("server", &self.server)
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Fully validated runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Non-empty, in configured order
    pub brokers: Vec<BrokerConfig>,
    pub topic_prefix: String,
    /// Always greater than zero
    pub refresh_interval: Duration,
    pub calibration: CalibrationOffsets,
    /// `Some` exactly when persistence is enabled
    pub persistence: Option<PersistenceConfig>,
}

/// Merges `env` over `file` over defaults and validates the result
pub fn resolve(
    env: &dyn SettingsSource,
    file: &dyn SettingsSource,
) -> Result<AppConfig, ConfigError> {
    let resolver = Resolver { env, file };

    let brokers = match resolver.lookup(Setting::Brokers) {
        Some((json, source)) => {
            let brokers = brokers::parse_broker_list(&json)?;
            info!("{} MQTT broker(s) loaded from {}", brokers.len(), source);
            brokers
        }
        None => return Err(ConfigError::MissingBrokers),
    };

    let topic_prefix = resolver
        .lookup(Setting::Topic)
        .map(|(topic, _)| topic)
        .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());

    let refresh_interval = match resolver.lookup(Setting::Refresh) {
        Some((value, _)) => parse_refresh(&value)?,
        None => Duration::from_secs(DEFAULT_REFRESH_SECS),
    };

    let calibration = CalibrationOffsets {
        temperature: resolver.float(Setting::CalTemperature)?,
        pressure: resolver.float(Setting::CalPressure)?,
        humidity: resolver.float(Setting::CalHumidity)?,
        lux: resolver.float(Setting::CalLux)?,
    };

    let persistence = if resolver.flag(Setting::UseSql)? {
        Some(PersistenceConfig {
            server: resolver.required_text(Setting::DbServer)?,
            name: resolver.required_text(Setting::DbName)?,
            username: resolver.required_text(Setting::DbUsername)?,
            password: resolver.required_text(Setting::DbPassword)?,
        })
    } else {
        None
    };

    let config = AppConfig {
        brokers,
        topic_prefix,
        refresh_interval,
        calibration,
        persistence,
    };
    debug!("Resolved configuration: {:?}", config);
    Ok(config)
}

struct Resolver<'a> {
    env: &'a dyn SettingsSource,
    file: &'a dyn SettingsSource,
}

impl Resolver<'_> {
    /// A variable that is set wins even when blank. The broker list is the
    /// exception: a blank `MQTT_BROKERS` falls through to the file.
    fn lookup(&self, setting: Setting) -> Option<(String, SourceKind)> {
        let found = self
            .env
            .get(setting)
            .filter(|value| setting != Setting::Brokers || !value.trim().is_empty())
            .map(|v| (v, SourceKind::Environment))
            .or_else(|| self.file.get(setting).map(|v| (v, SourceKind::File)));
        let source = found.as_ref().map_or(SourceKind::Default, |(_, source)| *source);
        debug!("{} taken from {}", setting.env_key(), source);
        found
    }

    fn float(&self, setting: Setting) -> Result<f64, ConfigError> {
        match self.lookup(setting) {
            Some((value, _)) => {
                value
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| ConfigError::InvalidNumber { setting, value })
            }
            None => Ok(0.0),
        }
    }

    fn flag(&self, setting: Setting) -> Result<bool, ConfigError> {
        match self.lookup(setting) {
            Some((value, _)) if value.trim().is_empty() => Ok(false),
            Some((value, _)) => parse_bool(&value).ok_or(ConfigError::InvalidBool { setting, value }),
            None => Ok(false),
        }
    }

    fn required_text(&self, setting: Setting) -> Result<String, ConfigError> {
        self.lookup(setting)
            .map(|(value, _)| value)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingPersistenceField(setting))
    }
}

/// Accepts `true/false/yes/no/1/0`, case-insensitive
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_refresh(value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidRefresh(value.to_string())),
    }
}
