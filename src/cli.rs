use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::Level;

pub const CONFIG_FILE_NAME: &str = "readings.toml";

/// Reads the weather board and publishes every sample to the configured MQTT brokers
#[derive(Debug, Parser)]
#[command(name = "weatherpi-readings", version, about)]
pub struct Args {
    /// Path to readings.toml; environment variables override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: Level,

    /// Seconds to wait for in-flight work after a shutdown signal
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..))]
    pub drain_timeout: u64,
}

/// Picks the config file: explicit path, next to the executable, then the
/// user config directory
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)));
    if let Some(path) = beside_exe.filter(|p| p.exists()) {
        return path;
    }

    dirs::config_dir()
        .map(|dir| dir.join("weatherpi").join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}
