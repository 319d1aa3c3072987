//! In-memory connector for driving the stream stack without a network.
//!
//! [`loopback`] returns a [`Connector`] for the client side and a
//! [`LoopbackListener`] that yields one [`LoopbackPeer`] per dialled session.
//! The peer plays the venue: it reads what the client sent and pushes frames
//! back. Dropping the peer closes that session.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tradebridge_core::BrokerError;

use crate::transport::{Connection, Connector, Frame};

/// Create a connected connector/listener pair.
pub fn loopback() -> (LoopbackConnector, LoopbackListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LoopbackConnector { accept: tx }, LoopbackListener { incoming: rx })
}

pub struct LoopbackConnector {
    accept: mpsc::UnboundedSender<LoopbackPeer>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError> {
        let (to_client, client_inbound) = mpsc::unbounded_channel();
        let (to_peer, peer_inbound) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            outbound: to_client,
            inbound: peer_inbound,
        };
        self.accept
            .send(peer)
            .map_err(|_| BrokerError::ConnectionFailed("loopback listener closed".to_string()))?;
        Ok(Box::new(LoopbackConnection {
            outbound: to_peer,
            inbound: client_inbound,
        }))
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }
}

struct LoopbackConnection {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), BrokerError> {
        self.outbound
            .send(frame)
            .map_err(|_| BrokerError::Transport("loopback peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, BrokerError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Accepts sessions dialled through the matching [`LoopbackConnector`].
pub struct LoopbackListener {
    incoming: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackListener {
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.incoming.recv().await
    }
}

/// The venue side of one loopback session.
pub struct LoopbackPeer {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackPeer {
    /// Push a raw frame to the client. Returns `false` once the client hung up.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(Frame::Text(text.into()))
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Next frame from the client, pings included.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Next decoded message from the client. Pings are answered and skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.inbound.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Ping(payload) => {
                    self.send_frame(Frame::Pong(payload));
                }
                Frame::Pong(_) => {}
            }
        }
    }

    /// Answer a correlated request with a success payload.
    pub fn respond(&self, request: &Value, data: Value) -> bool {
        self.send_json(&json!({
            "status": true,
            "returnData": data,
            "customTag": request["customTag"],
        }))
    }

    /// Answer a correlated request with a venue error.
    pub fn respond_error(&self, request: &Value, code: &str, message: &str) -> bool {
        self.send_json(&json!({
            "status": false,
            "errorCode": code,
            "errorDescr": message,
            "customTag": request["customTag"],
        }))
    }
}
