//! Persistent streaming connection with reconnect and liveness checking.
//!
//! A single background task owns the physical link. Everything else talks to
//! it through [`StreamTransport`], a cheap clonable handle, and observes it
//! through [`TransportEvent`]s. Link failures never surface as errors from
//! [`StreamTransport::send`]; they are published as events instead.
//!
//! Every accepted frame is stamped with the transport epoch. The epoch moves
//! on before each `Disconnected` or `Exception` event, and frames carrying an
//! older stamp are discarded unsent, so nothing reaches the venue after its
//! caller has been told the session failed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tradebridge_core::BrokerError;

use crate::subscribers::Subscribers;

/// Unanswered pings tolerated before the session is considered dead.
const MAX_UNANSWERED_PINGS: u32 = 2;

/// Configuration for the streaming connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoint URL (e.g. "wss://venue.example/stream").
    pub url: String,
    /// Idle time before a liveness ping is sent, in milliseconds.
    pub ping_interval_ms: u64,
    /// First reconnect delay, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Upper bound for the exponential reconnect delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "wss://127.0.0.1:5124/stream".to_string(),
            ping_interval_ms: 10_000,
            reconnect_interval_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let delay = self.reconnect_interval_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms.max(self.reconnect_interval_ms)))
    }
}

// ---------------------------------------------------------------------------
// Link abstraction
// ---------------------------------------------------------------------------

/// A single frame on the physical link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// An established link.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), BrokerError>;

    /// Next inbound frame, or `None` once the peer closed the link.
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<Frame, BrokerError>>;

    async fn close(&mut self);
}

/// Opens new links on demand.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError>;

    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> String;
}

/// WebSocket connector.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("WebSocket connect failed: {}", e)))?;
        Ok(Box::new(WsConnection { ws }))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), BrokerError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
        };
        self.ws
            .send(message)
            .await
            .map_err(|e| BrokerError::Transport(format!("Write error: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<Frame, BrokerError>> {
        loop {
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(BrokerError::Transport(format!("Read error: {}", e)))),
            };
            return match message {
                Message::Text(text) => Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => Some(
                    String::from_utf8(bytes)
                        .map(Frame::Text)
                        .map_err(|e| BrokerError::Serialization(format!("non UTF-8 payload: {}", e))),
                ),
                Message::Ping(payload) => Some(Ok(Frame::Ping(payload))),
                Message::Pong(payload) => Some(Ok(Frame::Pong(payload))),
                Message::Close(frame) => {
                    debug!(?frame, "stream closed by venue");
                    None
                }
                Message::Frame(_) => continue,
            };
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Lifecycle and data notifications delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A new session is up.
    Connected,
    /// The session ended; a reconnect follows unless the transport was shut down.
    Disconnected(String),
    /// A decoded inbound message.
    Data(Arc<Value>),
    /// A failure that did not necessarily end the session (connect or decode error).
    Exception(String),
}

enum TransportCommand {
    Activate,
    Send { text: String, epoch: u64 },
    Shutdown,
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

/// Handle to the background connection task.
#[derive(Clone)]
pub struct StreamTransport {
    commands: mpsc::UnboundedSender<TransportCommand>,
    handlers: Subscribers<TransportEvent>,
    endpoint: Arc<str>,
    epoch: Arc<AtomicU64>,
}

impl StreamTransport {
    /// Spawn the connection task. Nothing is dialled until the first
    /// [`connect`](Self::connect) or [`send`](Self::send).
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Subscribers::new();
        let endpoint = Arc::from(connector.endpoint());
        let epoch = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_transport(connector, config, rx, handlers.clone(), Arc::clone(&epoch)));
        Self {
            commands: tx,
            handlers,
            endpoint,
            epoch,
        }
    }

    /// Register a handler for lifecycle and data events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.handlers.subscribe()
    }

    /// Establish the connection without sending anything.
    pub fn connect(&self) {
        let _ = self.commands.send(TransportCommand::Activate);
    }

    /// Queue a message for the active session. Messages sent while no
    /// session is up are flushed in order once one is established.
    ///
    /// Returns the epoch the message was stamped with. It is dropped unsent
    /// if a `Disconnected` or `Exception` event ends that epoch first.
    pub fn send(&self, message: &Value) -> Result<u64, BrokerError> {
        let text = serde_json::to_string(message)?;
        let epoch = self.epoch();
        self.commands
            .send(TransportCommand::Send { text, epoch })
            .map_err(|_| BrokerError::Disconnected("transport stopped".to_string()))?;
        Ok(epoch)
    }

    /// Number of `Disconnected` and `Exception` events announced so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Close the link and stop reconnecting.
    pub fn shutdown(&self) {
        let _ = self.commands.send(TransportCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Where the connector dials, for logging.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

async fn run_transport(
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    handlers: Subscribers<TransportEvent>,
    epoch: Arc<AtomicU64>,
) {
    let mut outbox = Outbox::new(epoch);

    // Stay idle until first use.
    match commands.recv().await {
        Some(TransportCommand::Activate) => {}
        Some(TransportCommand::Send { text, epoch }) => outbox.push(text, epoch),
        Some(TransportCommand::Shutdown) | None => return,
    }

    let endpoint = connector.endpoint();
    let mut attempt: u32 = 0;
    loop {
        let mut conn = match connector.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(endpoint = %endpoint, attempt, error = %err, "Stream connect failed");
                outbox.end_epoch();
                handlers.publish(TransportEvent::Exception(err.to_string()));
                let delay = config.backoff(attempt);
                attempt = attempt.saturating_add(1);
                if !wait_backoff(delay, &mut commands, &mut outbox).await {
                    return;
                }
                continue;
            }
        };

        attempt = 0;
        info!(endpoint = %endpoint, "Stream session established");
        handlers.publish(TransportEvent::Connected);

        match run_session(conn.as_mut(), &config, &mut commands, &mut outbox, &handlers).await {
            SessionEnd::Shutdown => {
                conn.close().await;
                outbox.end_epoch();
                handlers.publish(TransportEvent::Disconnected("shutdown".to_string()));
                info!(endpoint = %endpoint, "Stream transport shut down");
                return;
            }
            SessionEnd::Lost(reason) => {
                warn!(endpoint = %endpoint, reason = %reason, "Stream session lost, reconnecting");
                outbox.end_epoch();
                handlers.publish(TransportEvent::Disconnected(reason));
                let delay = config.backoff(attempt);
                attempt = attempt.saturating_add(1);
                if !wait_backoff(delay, &mut commands, &mut outbox).await {
                    return;
                }
            }
        }
    }
}

/// Frames waiting for a session, all stamped with the current epoch.
struct Outbox {
    epoch: Arc<AtomicU64>,
    frames: VecDeque<String>,
}

impl Outbox {
    fn new(epoch: Arc<AtomicU64>) -> Self {
        Self {
            epoch,
            frames: VecDeque::new(),
        }
    }

    fn is_current(&self, stamp: u64) -> bool {
        stamp == self.epoch.load(Ordering::SeqCst)
    }

    fn push(&mut self, text: String, stamp: u64) {
        if self.is_current(stamp) {
            self.frames.push_back(text);
        } else {
            debug!(stamp, "dropping frame from an ended epoch");
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    /// Start a new epoch. Must precede the event that announces the failure.
    fn end_epoch(&mut self) {
        let ended = self.epoch.fetch_add(1, Ordering::SeqCst);
        if !self.frames.is_empty() {
            debug!(epoch = ended, dropped = self.frames.len(), "discarding queued frames");
            self.frames.clear();
        }
    }
}

/// Sleep out a reconnect delay while still queueing sends.
/// Returns `false` if the transport was shut down meanwhile.
async fn wait_backoff(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<TransportCommand>,
    outbox: &mut Outbox,
) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return true,
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::Send { text, epoch }) => outbox.push(text, epoch),
                Some(TransportCommand::Activate) => {}
                Some(TransportCommand::Shutdown) | None => return false,
            },
        }
    }
}

async fn run_session(
    conn: &mut dyn Connection,
    config: &TransportConfig,
    commands: &mut mpsc::UnboundedReceiver<TransportCommand>,
    outbox: &mut Outbox,
    handlers: &Subscribers<TransportEvent>,
) -> SessionEnd {
    while let Some(text) = outbox.pop() {
        if let Err(err) = conn.send(Frame::Text(text)).await {
            return SessionEnd::Lost(err.to_string());
        }
    }

    let period = config.ping_interval();
    let mut liveness = interval_at(Instant::now() + period, period);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_read = Instant::now();
    let mut unanswered: u32 = 0;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::Send { text, epoch }) => {
                    if !outbox.is_current(epoch) {
                        debug!(stamp = epoch, "dropping frame from an ended epoch");
                        continue;
                    }
                    if let Err(err) = conn.send(Frame::Text(text)).await {
                        return SessionEnd::Lost(err.to_string());
                    }
                }
                Some(TransportCommand::Activate) => {}
                Some(TransportCommand::Shutdown) | None => return SessionEnd::Shutdown,
            },
            frame = conn.recv() => {
                last_read = Instant::now();
                unanswered = 0;
                match frame {
                    Some(Ok(Frame::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => handlers.publish(TransportEvent::Data(Arc::new(value))),
                        Err(err) => {
                            warn!(error = %err, "Undecodable stream message");
                            outbox.end_epoch();
                            handlers.publish(TransportEvent::Exception(format!("decode error: {}", err)));
                        }
                    },
                    Some(Ok(Frame::Ping(payload))) => {
                        if let Err(err) = conn.send(Frame::Pong(payload)).await {
                            return SessionEnd::Lost(err.to_string());
                        }
                    }
                    Some(Ok(Frame::Pong(_))) => debug!("pong received"),
                    Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                    None => return SessionEnd::Lost("closed by peer".to_string()),
                }
            }
            _ = liveness.tick() => {
                if last_read.elapsed() < period {
                    continue;
                }
                if unanswered >= MAX_UNANSWERED_PINGS {
                    return SessionEnd::Lost("ping timeout".to_string());
                }
                unanswered += 1;
                debug!(unanswered, "link idle, sending ping");
                if let Err(err) = conn.send(Frame::Ping(Vec::new())).await {
                    return SessionEnd::Lost(err.to_string());
                }
            }
        }
    }
}
