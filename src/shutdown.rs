//! Process signal handling and the shutdown notice sent to connection handlers.

use std::io;

use tokio::sync::broadcast;

pub type ShutdownTx = broadcast::Sender<()>;
pub type ShutdownRx = broadcast::Receiver<()>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    broadcast::channel(1)
}

/// Operator interrupt listener.
///
/// Handlers are installed eagerly so that a failure surfaces at startup,
/// before the server starts accepting connections.
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for SIGINT or SIGTERM.
    #[cfg(unix)]
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = self.sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    /// Wait for Ctrl+C.
    #[cfg(not(unix))]
    pub async fn recv(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Unable to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await
            }
        }
    }
}
