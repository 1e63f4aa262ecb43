//! Control channel client
//!
//! One persistent WebSocket to the robot. Each connection attempt runs in
//! its own task and reports lifecycle and inbound text through an event
//! channel; outbound text goes through a per-connection command channel.
//! Dropping the event receiver tears the connection down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, RobotError};

/// Bound on establishing the WebSocket
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-connection event channel
const EVENT_CAPACITY: usize = 256;

/// Lifecycle and message events of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Handshake completed
    Connected,
    /// Connection closed; terminal
    Disconnected,
    /// Text frame received from the robot
    MessageReceived(String),
    /// Connection failed; terminal
    Error(String),
}

impl ControlEvent {
    /// Whether no further events follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }
}

/// Transport used by the connection state machine
pub trait Transport: Send + Sync + 'static {
    /// Start a connection attempt; events arrive in transport order
    fn connect(&self, url: &str) -> mpsc::Receiver<ControlEvent>;

    /// Best-effort send; `false` when nothing is open
    fn send(&self, message: &str) -> bool;

    /// Close the current connection, if any
    fn disconnect(&self);
}

/// Commands sent to the connection task
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Handle to the live connection task
struct Link {
    commands: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

/// WebSocket control channel client
pub struct ControlClient {
    link: Mutex<Option<Link>>,
    connect_timeout: Duration,
}

impl ControlClient {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether a connection is currently open
    pub fn is_open(&self) -> bool {
        self.lock_link()
            .as_ref()
            .is_some_and(|link| link.open.load(Ordering::SeqCst))
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ControlClient {
    fn connect(&self, url: &str) -> mpsc::Receiver<ControlEvent> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        // Replacing the link closes the previous connection's command channel
        *self.lock_link() = Some(Link {
            commands: command_tx,
            open: Arc::clone(&open),
        });

        tokio::spawn(run_connection(
            url.to_string(),
            self.connect_timeout,
            event_tx,
            command_rx,
            open,
        ));
        event_rx
    }

    fn send(&self, message: &str) -> bool {
        match self.lock_link().as_ref() {
            Some(link) if link.open.load(Ordering::SeqCst) => {
                link.commands.send(Outbound::Text(message.to_string())).is_ok()
            }
            _ => false,
        }
    }

    fn disconnect(&self) {
        if let Some(link) = self.lock_link().take() {
            let _ = link.commands.send(Outbound::Close);
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_socket(url: &str, timeout: Duration) -> Result<Socket> {
    let (socket, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| RobotError::Timeout(timeout))??;
    Ok(socket)
}

/// Drive one connection until it closes, fails or is abandoned
async fn run_connection(
    url: String,
    connect_timeout: Duration,
    event_tx: mpsc::Sender<ControlEvent>,
    mut command_rx: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
) {
    debug!("Opening control channel {}", url);
    let mut socket = match open_socket(&url, connect_timeout).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("❌ Control channel connect failed: {}", e);
            let _ = event_tx.send(ControlEvent::Error(e.to_string())).await;
            return;
        }
    };

    open.store(true, Ordering::SeqCst);
    info!("🔗 Control channel open: {}", url);
    if event_tx.send(ControlEvent::Connected).await.is_err() {
        open.store(false, Ordering::SeqCst);
        let _ = socket.close(None).await;
        return;
    }

    let terminal = loop {
        tokio::select! {
            // Queued commands, a manual close included, go before anything else
            biased;

            command = command_rx.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = socket.send(Message::Text(text)).await {
                        break Some(ControlEvent::Error(e.to_string()));
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = socket
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Manual disconnect".into(),
                        }))
                        .await;
                    break Some(ControlEvent::Disconnected);
                }
            },

            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if event_tx.send(ControlEvent::MessageReceived(text)).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Robot closed the control channel: {:?}", frame);
                    break Some(ControlEvent::Disconnected);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(ControlEvent::Error(e.to_string())),
                None => break Some(ControlEvent::Disconnected),
            },

            _ = event_tx.closed() => break None,
        }
    };

    open.store(false, Ordering::SeqCst);
    match terminal {
        Some(event) => {
            info!("🔌 Control channel closed: {:?}", event);
            let _ = event_tx.send(event).await;
        }
        None => {
            debug!("Control channel abandoned by consumer");
            let _ = socket.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(ControlEvent::Disconnected.is_terminal());
        assert!(ControlEvent::Error("x".into()).is_terminal());
        assert!(!ControlEvent::Connected.is_terminal());
        assert!(!ControlEvent::MessageReceived("x".into()).is_terminal());
    }

    #[tokio::test]
    async fn test_send_without_connection_is_rejected() {
        let client = ControlClient::new();
        assert!(!client.send(r#"{"command":"stop"}"#));
        assert!(!client.is_open());
        client.disconnect();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ControlClient::new().connect_timeout(Duration::from_secs(2));
        let mut events = client.connect(&format!("ws://{}", addr));
        match events.recv().await {
            Some(ControlEvent::Error(_)) => {}
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(events.recv().await.is_none());
        assert!(!client.send("hello"));
    }
}
