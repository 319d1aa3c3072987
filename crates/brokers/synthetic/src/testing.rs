//! Loopback venue helpers shared by the unit tests of this crate.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tradebridge_brokers_common::{
    loopback, LoopbackListener, LoopbackPeer, RpcClient, StreamTransport, TransportConfig,
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

pub(crate) fn venue() -> (RpcClient, LoopbackListener) {
    let (connector, listener) = loopback();
    let config = TransportConfig {
        url: "loopback".to_string(),
        ping_interval_ms: 60_000,
        reconnect_interval_ms: 10,
        max_backoff_ms: 50,
    };
    let transport = StreamTransport::new(Arc::new(connector), config);
    (RpcClient::new(transport), listener)
}

pub(crate) async fn accept(listener: &mut LoopbackListener) -> LoopbackPeer {
    timeout(WAIT, listener.accept()).await.unwrap().unwrap()
}

pub(crate) async fn next_message(peer: &mut LoopbackPeer) -> Value {
    timeout(WAIT, peer.recv_json()).await.unwrap().unwrap()
}

/// Read messages until one with the given command arrives.
pub(crate) async fn expect_command(peer: &mut LoopbackPeer, command: &str) -> Value {
    loop {
        let message = next_message(peer).await;
        if message["command"] == command {
            return message;
        }
    }
}

pub(crate) fn push_quote(peer: &LoopbackPeer, symbol: &str, bid: &str, ask: &str) {
    peer.send_json(&json!({
        "command": "quote",
        "data": {"symbol": symbol, "bid": bid, "ask": ask, "timestamp": 1_700_000_000_000i64},
    }));
}

/// A scripted venue answering the calls the broker makes on its own.
///
/// Pushes go through [`ScriptedVenue::push`]; executed trade transactions
/// and quote subscriptions are reported on their channels.
pub(crate) struct ScriptedVenue {
    pushes: mpsc::UnboundedSender<Value>,
    pub(crate) subscribed: mpsc::UnboundedReceiver<String>,
    pub(crate) transactions: mpsc::UnboundedReceiver<Value>,
}

impl ScriptedVenue {
    pub(crate) fn serve(mut peer: LoopbackPeer, symbols: Value) -> Self {
        let (pushes, mut push_rx) = mpsc::unbounded_channel::<Value>();
        let (subscribed_tx, subscribed) = mpsc::unbounded_channel();
        let (transactions_tx, transactions) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut next_order = 1000u64;
            loop {
                tokio::select! {
                    message = peer.recv_json() => {
                        let Some(message) = message else { return };
                        match message["command"].as_str() {
                            Some("getAllSymbols") => {
                                peer.respond(&message, symbols.clone());
                            }
                            Some("getTrades") => {
                                peer.respond(&message, json!([]));
                            }
                            Some("tradeTransaction") => {
                                next_order += 1;
                                let _ = transactions_tx.send(message["arguments"]["tradeTransInfo"].clone());
                                peer.respond(&message, json!({"order": next_order}));
                            }
                            Some("subscribe") => {
                                if let Some(symbol) = message["symbol"].as_str() {
                                    let _ = subscribed_tx.send(symbol.to_string());
                                }
                            }
                            Some("unsubscribe") => {}
                            _ => {
                                peer.respond(&message, json!({}));
                            }
                        }
                    }
                    push = push_rx.recv() => match push {
                        Some(push) => {
                            peer.send_json(&push);
                        }
                        None => return,
                    },
                }
            }
        });
        Self {
            pushes,
            subscribed,
            transactions,
        }
    }

    pub(crate) fn quote(&self, symbol: &str, bid: &str, ask: &str) {
        let _ = self.pushes.send(json!({
            "command": "quote",
            "data": {"symbol": symbol, "bid": bid, "ask": ask, "timestamp": 1_700_000_000_000i64},
        }));
    }

    pub(crate) fn push(&self, message: Value) {
        let _ = self.pushes.send(message);
    }

    pub(crate) async fn next_subscription(&mut self) -> String {
        timeout(WAIT, self.subscribed.recv()).await.unwrap().unwrap()
    }

    pub(crate) async fn next_transaction(&mut self) -> Value {
        timeout(WAIT, self.transactions.recv()).await.unwrap().unwrap()
    }
}
