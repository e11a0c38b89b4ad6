use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::instrument;

use crate::config::Settings;
use crate::shutdown::ShutdownRx;

const SHUTDOWN_REASON: &str = "Server shutting down";
/// How long the server waits for the client to answer its close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Client,
    Server,
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::Client => write!(f, "client"),
            Initiator::Server => write!(f, "server"),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub initiator: Initiator,
    pub code: u16,
    pub reason: String,
}

impl Closure {
    fn from_close_frame(initiator: Initiator, frame: Option<&CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                initiator,
                code: frame.code.into(),
                reason: frame.reason.to_string(),
            },
            None => Self {
                initiator,
                code: CloseCode::Status.into(),
                reason: String::new(),
            },
        }
    }

    /// The transport ended without a closing handshake.
    fn abnormal() -> Self {
        Self {
            initiator: Initiator::Client,
            code: CloseCode::Abnormal.into(),
            reason: String::new(),
        }
    }
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection closed by {}: {}, {}",
            self.initiator, self.code, self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Message(String),
    Closed(Closure),
    Disconnected,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected => write!(f, "A client has connected."),
            ConnectionEvent::Message(content) => {
                write!(f, "Received message from client: {content}")
            }
            ConnectionEvent::Closed(closure) => write!(f, "{closure}"),
            ConnectionEvent::Disconnected => write!(f, "Client disconnected."),
        }
    }
}

/// A connection event tagged with the peer it happened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub peer: SocketAddr,
    pub kind: ConnectionEvent,
}

pub type EventSender = mpsc::UnboundedSender<Event>;

pub(crate) struct ConnectionHandler {
    address: SocketAddr,
    settings: Arc<Settings>,
    events: Option<EventSender>,
    shutdown: ShutdownRx,
}

impl ConnectionHandler {
    pub(crate) fn new(
        address: SocketAddr,
        settings: Arc<Settings>,
        events: Option<EventSender>,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            address,
            settings,
            events,
            shutdown,
        }
    }

    #[instrument(skip_all, fields(peer = %self.address))]
    pub(crate) async fn handle(mut self, socket: TcpStream) -> Result<()> {
        let mut stream = tokio::select! {
            stream = accept_async(socket) => stream?,
            _ = self.shutdown.recv() => {
                debug!("Shutdown before handshake completed");
                return Ok(());
            }
        };

        self.emit(ConnectionEvent::Connected);
        let closure = self.receive_messages(&mut stream).await;
        self.emit(ConnectionEvent::Closed(closure));
        self.emit(ConnectionEvent::Disconnected);

        Ok(())
    }

    /// Consume messages until the connection ends, returning how it ended.
    async fn receive_messages(&mut self, stream: &mut WebSocketStream<TcpStream>) -> Closure {
        let mut closing = None;

        loop {
            let message = tokio::select! {
                message = stream.next() => Some(message),
                _ = self.shutdown.recv() => None,
            };
            let Some(message) = message else {
                return match closing {
                    Some(closure) => closure,
                    None => self.close_for_shutdown(stream).await,
                };
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    self.emit(ConnectionEvent::Message(text.to_string()));
                    if self.settings.echo {
                        let reply = Message::text(format!("Echoing back: {text}"));
                        if let Some(closure) = self.echo(stream, reply).await {
                            return closure;
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    self.emit(ConnectionEvent::Message(format!("{data:?}")));
                    if self.settings.echo {
                        if let Some(closure) = self.echo(stream, Message::Binary(data)).await {
                            return closure;
                        }
                    }
                }
                // The reply is queued by the library; keep polling so it gets flushed.
                Some(Ok(Message::Close(frame))) => {
                    closing = Some(Closure::from_close_frame(Initiator::Client, frame.as_ref()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Connection error: {e}");
                    return closing.unwrap_or_else(Closure::abnormal);
                }
                None => return closing.unwrap_or_else(Closure::abnormal),
            }
        }
    }

    /// Send `reply` unless the server starts shutting down first.
    ///
    /// Returns the closure when the connection has to end.
    async fn echo(
        &mut self,
        stream: &mut WebSocketStream<TcpStream>,
        reply: Message,
    ) -> Option<Closure> {
        let sent = tokio::select! {
            sent = stream.send(reply) => Some(sent),
            _ = self.shutdown.recv() => None,
        };
        match sent {
            Some(Ok(())) => None,
            Some(Err(e)) => {
                debug!("Unable to echo message: {e}");
                Some(Closure::abnormal())
            }
            None => Some(self.close_for_shutdown(stream).await),
        }
    }

    /// Start the closing handshake and wait for the client to complete it,
    /// for at most `CLOSE_TIMEOUT`.
    async fn close_for_shutdown(&self, stream: &mut WebSocketStream<TcpStream>) -> Closure {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: Utf8Bytes::from_static(SHUTDOWN_REASON),
        };
        let closure = Closure::from_close_frame(Initiator::Server, Some(&frame));

        let handshake = async {
            stream.close(Some(frame)).await?;
            while let Some(message) = stream.next().await {
                message?;
            }
            Ok::<_, tokio_tungstenite::tungstenite::Error>(())
        };
        match timeout(CLOSE_TIMEOUT, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing handshake failed: {e}"),
            Err(_) => debug!("Client did not answer the close frame in time"),
        }

        closure
    }

    fn emit(&self, kind: ConnectionEvent) {
        info!("{kind}");
        if let Some(events) = &self.events {
            // Observer is gone; nothing left to notify.
            let _ = events.send(Event {
                peer: self.address,
                kind,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_from_close_frame() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("bye"),
        };
        let closure = Closure::from_close_frame(Initiator::Client, Some(&frame));
        assert_eq!(closure.code, 1000);
        assert_eq!(closure.reason, "bye");
        assert_eq!(closure.to_string(), "Connection closed by client: 1000, bye");
    }

    #[test]
    fn test_closure_without_status() {
        let closure = Closure::from_close_frame(Initiator::Client, None);
        assert_eq!(closure.code, 1005);
        assert_eq!(closure.reason, "");
    }

    #[test]
    fn test_abnormal_closure() {
        let closure = Closure::abnormal();
        assert_eq!(closure.initiator, Initiator::Client);
        assert_eq!(closure.to_string(), "Connection closed by client: 1006, ");
    }

    #[test]
    fn test_event_lines() {
        assert_eq!(
            ConnectionEvent::Connected.to_string(),
            "A client has connected."
        );
        assert_eq!(
            ConnectionEvent::Message("hello".to_string()).to_string(),
            "Received message from client: hello"
        );
        assert_eq!(
            ConnectionEvent::Disconnected.to_string(),
            "Client disconnected."
        );
    }
}
