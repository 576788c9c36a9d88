//! Shutdown request and OS signal handling
//!
//! [`Shutdown`] is the only cancellation source of the loop. It remembers
//! when it was first requested so the drain deadline is measured from the
//! signal, not from whenever the scheduler gets around to looking at it.

use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    requested_at: Arc<OnceLock<Instant>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown; later calls keep the first timestamp
    pub fn request(&self) {
        self.requested_at.get_or_init(Instant::now);
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn requested_at(&self) -> Option<Instant> {
        self.requested_at.get().copied()
    }

    /// Completes once shutdown has been requested
    pub async fn requested(&self) {
        self.token.cancelled().await
    }
}

/// Completes on SIGINT, SIGTERM, SIGQUIT or Ctrl-C
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Turns the first OS signal into a shutdown request
///
/// If the handlers cannot be installed the process keeps running and can only
/// be stopped by killing it.
pub fn spawn_signal_listener(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.request();
            }
            Err(e) => error!("Could not install signal handlers: {}", e),
        }
    })
}
