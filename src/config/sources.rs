//! The two places a setting can come from: the process environment and a TOML file

#[cfg(test)]
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::ConfigError;

/// Every setting the resolver knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    Brokers,
    Topic,
    Refresh,
    UseSql,
    DbServer,
    DbName,
    DbUsername,
    DbPassword,
    CalTemperature,
    CalPressure,
    CalHumidity,
    CalLux,
}

impl Setting {
    #[cfg(test)]
    pub const ALL: [Setting; 12] = [
        Setting::Brokers,
        Setting::Topic,
        Setting::Refresh,
        Setting::UseSql,
        Setting::DbServer,
        Setting::DbName,
        Setting::DbUsername,
        Setting::DbPassword,
        Setting::CalTemperature,
        Setting::CalPressure,
        Setting::CalHumidity,
        Setting::CalLux,
    ];

    pub fn env_key(self) -> &'static str {
        match self {
            Setting::Brokers => "MQTT_BROKERS",
            Setting::Topic => "MQTT_TOPIC",
            Setting::Refresh => "MQTT_REFRESH",
            Setting::UseSql => "DB_USE_SQL",
            Setting::DbServer => "DB_SERVER",
            Setting::DbName => "DB_NAME",
            Setting::DbUsername => "DB_USERNAME",
            Setting::DbPassword => "DB_PASSWORD",
            Setting::CalTemperature => "CAL_TEMPERATURE",
            Setting::CalPressure => "CAL_PRESSURE",
            Setting::CalHumidity => "CAL_HUMIDITY",
            Setting::CalLux => "CAL_LUX",
        }
    }

    /// `(section, key)` inside the TOML file
    pub fn file_key(self) -> (&'static str, &'static str) {
        match self {
            Setting::Brokers => ("broker", "brokers"),
            Setting::Topic => ("broker", "topic"),
            Setting::Refresh => ("broker", "refresh"),
            Setting::UseSql => ("db", "usesql"),
            Setting::DbServer => ("db", "server"),
            Setting::DbName => ("db", "database"),
            Setting::DbUsername => ("db", "username"),
            Setting::DbPassword => ("db", "password"),
            Setting::CalTemperature => ("calibration", "temperature"),
            Setting::CalPressure => ("calibration", "pressure"),
            Setting::CalHumidity => ("calibration", "humidity"),
            Setting::CalLux => ("calibration", "lux"),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (section, key) = self.file_key();
        write!(f, "{} ({}.{})", self.env_key(), section, key)
    }
}

/// Which source a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Environment,
    File,
    Default,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SourceKind::Environment => write!(f, "environment"),
            SourceKind::File => write!(f, "config file"),
            SourceKind::Default => write!(f, "default"),
        }
    }
}

/// A source of raw setting values
///
/// Values are handed out as text; typing and validation happen in the resolver
/// so both sources are held to the same rules.
pub trait SettingsSource {
    fn get(&self, setting: Setting) -> Option<String>;
}

/// Reads `std::env`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl SettingsSource for ProcessEnv {
    fn get(&self, setting: Setting) -> Option<String> {
        std::env::var(setting.env_key()).ok()
    }
}

/// Fixed environment, keyed by variable name
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct EnvMap(HashMap<String, String>);

#[cfg(test)]
impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

#[cfg(test)]
impl SettingsSource for EnvMap {
    fn get(&self, setting: Setting) -> Option<String> {
        self.0.get(setting.env_key()).cloned()
    }
}

/// Parsed `readings.toml`
///
/// ```toml
/// [broker]
/// brokers = '[{"host": "mqtt.local", "port": 1883}]'
/// topic = "Weatherstation/"
/// refresh = 300
///
/// [db]
/// usesql = false
///
/// [calibration]
/// temperature = -2.0
/// ```
#[derive(Debug, Default, Clone)]
pub struct ConfigFile {
    table: toml::Table,
}

impl ConfigFile {
    /// A file source with no values, used when no file exists
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let table = content.parse::<toml::Table>().map_err(|e| ConfigError::FileParse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        Ok(Self { table })
    }

    /// Loads `path`, or an empty source if it does not exist
    ///
    /// A missing file is only a warning: a deployment may pass everything
    /// through the environment.
    pub fn load_optional(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(
                "Config file not found: {}. Using environment variables.",
                path.display()
            );
            return Ok(Self::empty());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let table = content.parse::<toml::Table>().map_err(|e| ConfigError::FileParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        info!("Config file loaded: {}", path.display());
        Ok(Self { table })
    }
}

impl SettingsSource for ConfigFile {
    fn get(&self, setting: Setting) -> Option<String> {
        let (section, key) = setting.file_key();
        let value = self.table.get(section)?.as_table()?.get(key)?;
        match value {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            // Native arrays (the broker list) are handed over as JSON text
            other @ (toml::Value::Array(_) | toml::Value::Table(_)) => {
                serde_json::to_string(other).ok()
            }
            toml::Value::Datetime(d) => Some(d.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn env_keys_are_unique() {
        let mut keys: Vec<&str> = Setting::ALL.iter().map(|s| s.env_key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), Setting::ALL.len());
    }

    #[test]
    fn blank_env_values_are_handed_out() {
        let env = EnvMap::new().with("MQTT_TOPIC", "");
        assert_eq!(env.get(Setting::Topic).as_deref(), Some(""));
        assert_eq!(env.get(Setting::DbServer), None);
    }

    #[test]
    fn file_scalars_are_returned_as_text() {
        let file = ConfigFile::parse(
            r#"
            [broker]
            topic = "Garden/"
            refresh = 60

            [db]
            usesql = true

            [calibration]
            temperature = -2.5
            "#,
        )
        .unwrap();

        assert_eq!(file.get(Setting::Topic).as_deref(), Some("Garden/"));
        assert_eq!(file.get(Setting::Refresh).as_deref(), Some("60"));
        assert_eq!(file.get(Setting::UseSql).as_deref(), Some("true"));
        assert_eq!(file.get(Setting::CalTemperature).as_deref(), Some("-2.5"));
        assert_eq!(file.get(Setting::CalLux), None);
    }

    #[test]
    fn native_broker_array_becomes_json() {
        let file = ConfigFile::parse(
            r#"
            [[broker.brokers]]
            host = "a"
            port = 1883
            "#,
        )
        .unwrap();

        let json = file.get(Setting::Brokers).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["host"], "a");
        assert_eq!(value[0]["port"], 1883);
    }

    #[test]
    fn missing_file_is_an_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::load_optional(&dir.path().join("readings.toml")).unwrap();
        assert_eq!(file.get(Setting::Topic), None);
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[broker\ntopic = ").unwrap();

        let err = ConfigFile::load_optional(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::FileParse { .. }));
    }
}
