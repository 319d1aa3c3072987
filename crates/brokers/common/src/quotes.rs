//! Reference-counted quote subscriptions multiplexed over one session.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tradebridge_core::Quote;

use crate::limiter::CommandLimiter;
use crate::rpc::{RpcClient, SessionEvent};

/// Configuration for the quote hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Stream channel name used in subscribe/unsubscribe commands.
    pub channel: String,
    /// Minimum spacing between subscribe/unsubscribe commands, in milliseconds.
    pub command_spacing_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel: "quotes".to_string(),
            command_spacing_ms: 200,
        }
    }
}

enum HubCommand {
    Subscribe {
        symbol: String,
        id: u64,
        listener: mpsc::UnboundedSender<Quote>,
    },
    Release {
        symbol: String,
        id: u64,
    },
    Latest {
        symbol: String,
        reply: oneshot::Sender<Option<Quote>>,
    },
    Active {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the hub task.
#[derive(Clone)]
pub struct QuoteHub {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl QuoteHub {
    pub fn new(rpc: RpcClient, config: HubConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let limiter = CommandLimiter::with_spacing(Duration::from_millis(config.command_spacing_ms));
        tokio::spawn(run_outbox(rpc.clone(), limiter, outbox_rx));
        tokio::spawn(run_hub(rpc, config, rx, outbox_tx));
        Self {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start receiving quotes for `symbol`. The first subscriber to a symbol
    /// makes the hub subscribe at the venue; dropping the last handle
    /// unsubscribes.
    pub fn subscribe(&self, symbol: &str) -> QuoteSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(HubCommand::Subscribe {
            symbol: symbol.to_string(),
            id,
            listener: tx,
        });
        QuoteSubscription {
            symbol: symbol.to_string(),
            id,
            receiver: rx,
            hub: self.commands.clone(),
            latest: None,
        }
    }

    /// Most recent quote the hub has seen for `symbol`.
    pub async fn latest(&self, symbol: &str) -> Option<Quote> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Latest {
                symbol: symbol.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Symbols with at least one live subscription.
    pub async fn active_symbols(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Active { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// A live quote subscription. Dropping it releases the reference.
pub struct QuoteSubscription {
    symbol: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Quote>,
    hub: mpsc::UnboundedSender<HubCommand>,
    latest: Option<Quote>,
}

impl QuoteSubscription {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Wait for the next quote. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Quote> {
        let quote = self.receiver.recv().await?;
        self.latest = Some(quote.clone());
        Some(quote)
    }

    /// Drain queued quotes and return the most recent one seen so far.
    pub fn latest(&mut self) -> Option<&Quote> {
        while let Ok(quote) = self.receiver.try_recv() {
            self.latest = Some(quote);
        }
        self.latest.as_ref()
    }
}

impl Drop for QuoteSubscription {
    fn drop(&mut self) {
        let _ = self.hub.send(HubCommand::Release {
            symbol: std::mem::take(&mut self.symbol),
            id: self.id,
        });
    }
}

#[derive(Default)]
struct SymbolSlot {
    listeners: HashMap<u64, mpsc::UnboundedSender<Quote>>,
    latest: Option<Quote>,
}

struct HubState {
    channel: String,
    /// Ordered so re-subscription after reconnect is deterministic.
    symbols: BTreeMap<String, SymbolSlot>,
    ready: bool,
    outbox: mpsc::UnboundedSender<Value>,
}

impl HubState {
    fn stream_command(&self, command: &str, symbol: &str) {
        let _ = self.outbox.send(json!({
            "command": command,
            "symbol": symbol,
            "channel": self.channel,
        }));
    }

    fn on_subscribe(&mut self, rpc: &RpcClient, symbol: String, id: u64, listener: mpsc::UnboundedSender<Quote>) {
        let slot = self.symbols.entry(symbol.clone()).or_default();
        if let Some(latest) = &slot.latest {
            let mut cached = latest.clone();
            cached.snapshot = true;
            let _ = listener.send(cached);
        }
        slot.listeners.insert(id, listener);
        if slot.listeners.len() == 1 {
            if self.ready {
                debug!(symbol = %symbol, "subscribing to quotes");
                self.stream_command("subscribe", &symbol);
            } else {
                rpc.transport().connect();
            }
        }
    }

    fn on_release(&mut self, symbol: &str, id: u64) {
        let Some(slot) = self.symbols.get_mut(symbol) else {
            return;
        };
        slot.listeners.remove(&id);
        if slot.listeners.is_empty() {
            self.symbols.remove(symbol);
            if self.ready {
                debug!(symbol = %symbol, "unsubscribing from quotes");
                self.stream_command("unsubscribe", symbol);
            }
        }
    }

    fn on_ready(&mut self) {
        self.ready = true;
        let symbols: Vec<String> = self.symbols.keys().cloned().collect();
        if !symbols.is_empty() {
            info!(count = symbols.len(), "re-subscribing quote streams");
        }
        for symbol in symbols {
            self.stream_command("subscribe", &symbol);
        }
    }

    fn on_lost(&mut self) {
        self.ready = false;
        for slot in self.symbols.values_mut() {
            slot.latest = None;
        }
    }

    fn on_push(&mut self, value: &Value) {
        if value.get("command").and_then(Value::as_str) != Some("quote") {
            return;
        }
        let quote = match parse_quote(value) {
            Ok(quote) => quote,
            Err(err) => {
                warn!(error = %err, "malformed quote push");
                return;
            }
        };
        let Some(slot) = self.symbols.get_mut(&quote.symbol) else {
            return;
        };
        for listener in slot.listeners.values() {
            let _ = listener.send(quote.clone());
        }
        slot.latest = Some(quote);
    }
}

async fn run_hub(
    rpc: RpcClient,
    config: HubConfig,
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
    outbox: mpsc::UnboundedSender<Value>,
) {
    let mut sessions = rpc.sessions();
    let mut state = HubState {
        channel: config.channel,
        symbols: BTreeMap::new(),
        ready: false,
        outbox,
    };

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(HubCommand::Subscribe { symbol, id, listener }) => {
                    state.on_subscribe(&rpc, symbol, id, listener)
                }
                Some(HubCommand::Release { symbol, id }) => state.on_release(&symbol, id),
                Some(HubCommand::Latest { symbol, reply }) => {
                    let latest = state.symbols.get(&symbol).and_then(|slot| slot.latest.clone());
                    let _ = reply.send(latest);
                }
                Some(HubCommand::Active { reply }) => {
                    let _ = reply.send(state.symbols.keys().cloned().collect());
                }
                None => break,
            },
            event = sessions.recv() => match event {
                Some(SessionEvent::Ready) => state.on_ready(),
                Some(SessionEvent::Lost(_)) => state.on_lost(),
                Some(SessionEvent::Push(value)) => state.on_push(&value),
                None => break,
            },
        }
    }
    debug!("quote hub stopped");
}

async fn run_outbox(rpc: RpcClient, limiter: CommandLimiter, mut outbox: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = outbox.recv().await {
        limiter.until_ready().await;
        if let Err(err) = rpc.notify(&message) {
            warn!(error = %err, "failed to send stream command");
        }
    }
}

#[derive(Deserialize)]
struct QuotePush {
    symbol: String,
    bid: Decimal,
    ask: Decimal,
    /// Milliseconds since the epoch.
    #[serde(default)]
    timestamp: Option<i64>,
}

fn parse_quote(value: &Value) -> Result<Quote, serde_json::Error> {
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    let push: QuotePush = serde_json::from_value(data)?;
    let timestamp = push
        .timestamp
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Ok(Quote {
        symbol: push.symbol,
        bid: push.bid,
        ask: push.ask,
        timestamp,
        snapshot: false,
    })
}
