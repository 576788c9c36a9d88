pub mod cli;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod reading;
pub mod scheduler;
pub mod sensor;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::cli::Args;
use crate::config::{ConfigFile, ProcessEnv};
use crate::mqtt::{BrokerTransport, MqttTransport};
use crate::persistence::{MySqlStore, ReadingStore};
use crate::scheduler::shutdown::spawn_signal_listener;
use crate::scheduler::{Shutdown, TickScheduler, Timeouts};
use crate::sensor::board::{self, WeatherBoard};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.log_level)?;
    info!("Starting weatherpi-readings {}", env!("CARGO_PKG_VERSION"));

    // Configuration is resolved once and never changes afterwards
    let config_path = cli::config_path(args.config.as_deref());
    let file = ConfigFile::load_optional(&config_path)?;
    let config = Arc::new(config::resolve(&ProcessEnv, &file)?);

    let board = tokio::task::spawn_blocking(|| WeatherBoard::open(board::DEFAULT_BUS))
        .await?
        .wrap_err("Failed to initialise the weather board")?;

    let timeouts = Timeouts {
        drain: Duration::from_secs(args.drain_timeout),
        ..Timeouts::default()
    };
    let shutdown = Shutdown::new();
    let _signals = spawn_signal_listener(shutdown.clone());

    let store = config
        .persistence
        .clone()
        .map(|db| Box::new(MySqlStore::new(db)) as Box<dyn ReadingStore>);
    let client_id_base = mqtt::client_id_base();
    info!("MQTT client id stem: {}", client_id_base);

    let scheduler = TickScheduler::create(
        config,
        sensor::shared(board),
        store,
        |_| Box::new(MqttTransport::new()) as Box<dyn BrokerTransport>,
        &client_id_base,
        timeouts,
        shutdown,
    );

    let stopped = scheduler
        .start()
        .await
        .run_until_shutdown()
        .await
        .drain()
        .await;

    info!("Stopped after {} ticks", stopped.stats().ticks);
    Ok(())
}

fn setup(log_level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(log_level);
    Ok(())
}

fn setup_logging_env(log_level: Level) {
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
