use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::config::Settings;
use crate::connection::{ConnectionHandler, EventSender};
use crate::shutdown::shutdown_channel;

/// Pause after a failed accept so persistent errors (EMFILE) don't spin.
pub const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);
/// How long open connections get to close before they are aborted.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Server {
    listener: TcpListener,
    settings: Arc<Settings>,
    events: Option<EventSender>,
}

impl Server {
    pub fn new(listener: TcpListener, settings: Settings) -> Self {
        Self {
            listener,
            settings: Arc::new(settings),
            events: None,
        }
    }

    /// Forward every connection event to `events` in addition to logging it.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then close every open
    /// connection and wait for their handlers to finish.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        let (shutdown_tx, _) = shutdown_channel();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, address)) => {
                        debug!(%address, "New connection");
                        let handler = ConnectionHandler::new(
                            address,
                            self.settings.clone(),
                            self.events.clone(),
                            shutdown_tx.subscribe(),
                        );
                        connections.spawn(async move {
                            if let Err(e) = handler.handle(socket).await {
                                error!(%address, "Connection failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Unable to accept connection: {e}");
                        sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection handler panicked: {e}");
                    }
                }
            }
        }

        drop(self.listener);
        info!(open = connections.len(), "Closing open connections");
        // No receivers left when every handler has already finished.
        let _ = shutdown_tx.send(());
        let drained = timeout(DRAIN_TIMEOUT, async {
            while let Some(finished) = connections.join_next().await {
                if let Err(e) = finished {
                    error!("Connection handler panicked: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(open = connections.len(), "Aborting connections that did not close in time");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
    }
}
