//! In-process venue used by `--dry-run`.
//!
//! Speaks the same wire protocol as the real stream over a loopback link:
//! answers login, catalog, position and trade calls, and streams
//! random-walk quotes for subscribed symbols.

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use tradebridge_brokers_common::{loopback, LoopbackConnector, LoopbackListener, LoopbackPeer};

struct MockSymbol {
    symbol: &'static str,
    asset: &'static str,
    currency: &'static str,
    category: &'static str,
    precision: u32,
    contract_size: i64,
    /// Starting mid price, scaled by `precision`.
    start: i64,
}

const SYMBOLS: &[MockSymbol] = &[
    MockSymbol { symbol: "EURUSD", asset: "EUR", currency: "USD", category: "FX", precision: 5, contract_size: 100_000, start: 108_500 },
    MockSymbol { symbol: "GBPUSD", asset: "GBP", currency: "USD", category: "FX", precision: 5, contract_size: 100_000, start: 127_000 },
    MockSymbol { symbol: "EURGBP", asset: "EUR", currency: "GBP", category: "FX", precision: 5, contract_size: 100_000, start: 85_400 },
    MockSymbol { symbol: "USDJPY", asset: "USD", currency: "JPY", category: "FX", precision: 3, contract_size: 100_000, start: 150_250 },
    MockSymbol { symbol: "USDCHF", asset: "USD", currency: "CHF", category: "FX", precision: 5, contract_size: 100_000, start: 88_100 },
    MockSymbol { symbol: "US500", asset: "USD", currency: "USD", category: "IND", precision: 1, contract_size: 50, start: 51_000 },
];

struct OpenPosition {
    symbol: String,
    side: &'static str,
    volume: Decimal,
    open_price: Decimal,
    open_time: chrono::DateTime<Utc>,
}

/// Book-keeping of the simulated venue, shared by every session.
pub struct VenueState {
    prices: HashMap<&'static str, i64>,
    positions: BTreeMap<u64, OpenPosition>,
    next_order: u64,
}

impl Default for VenueState {
    fn default() -> Self {
        Self {
            prices: SYMBOLS.iter().map(|s| (s.symbol, s.start)).collect(),
            positions: BTreeMap::new(),
            next_order: 1,
        }
    }
}

impl VenueState {
    fn symbols_payload(&self) -> Value {
        Value::Array(
            SYMBOLS
                .iter()
                .map(|s| {
                    json!({
                        "symbol": s.symbol,
                        "currency": s.asset,
                        "currencyProfit": s.currency,
                        "categoryName": s.category,
                        "precision": s.precision,
                        "contractSize": s.contract_size,
                        "lotStep": "0.01",
                        "lotMin": "0.01",
                        "leverage": 30,
                    })
                })
                .collect(),
        )
    }

    fn position_event(&self, id: u64, position: &OpenPosition, kind: &str) -> Value {
        json!({
            "order": id,
            "position": id,
            "symbol": position.symbol,
            "cmd": position.side,
            "openPrice": position.open_price,
            "volume": position.volume,
            "openTime": position.open_time,
            "type": kind,
            "snapshot": false,
            "closed": false,
        })
    }

    fn open_positions(&self) -> Value {
        Value::Array(
            self.positions
                .iter()
                .map(|(id, position)| self.position_event(*id, position, "OPEN"))
                .collect(),
        )
    }

    /// Apply a `tradeTransaction`. Returns the response payload and the
    /// position events it produced.
    pub fn transact(&mut self, info: &Value) -> Result<(Value, Vec<Value>), (&'static str, String)> {
        let decimal = |field: &str| -> Result<Decimal, (&'static str, String)> {
            serde_json::from_value(info[field].clone()).map_err(|_| ("BE1", format!("invalid {}", field)))
        };
        let volume = decimal("volume")?;
        let price = decimal("price")?;
        if volume <= Decimal::ZERO {
            return Err(("BE2", "volume must be positive".to_string()));
        }
        let order = self.next_order;
        self.next_order += 1;

        match info["type"].as_u64() {
            Some(0) => {
                let symbol = info["symbol"].as_str().unwrap_or_default();
                if !SYMBOLS.iter().any(|s| s.symbol == symbol) {
                    return Err(("BE115", format!("symbol {} does not exist", symbol)));
                }
                let side = if info["cmd"].as_u64() == Some(1) { "sell" } else { "buy" };
                let position = OpenPosition {
                    symbol: symbol.to_string(),
                    side,
                    volume,
                    open_price: price,
                    open_time: Utc::now(),
                };
                let event = self.position_event(order, &position, "OPEN");
                self.positions.insert(order, position);
                Ok((json!({ "order": order }), vec![event]))
            }
            Some(2) => {
                let id = info["order"].as_u64().unwrap_or_default();
                let Some(position) = self.positions.get_mut(&id) else {
                    return Err(("BE9", format!("position {} not found", id)));
                };
                let closed_volume = volume.min(position.volume);
                position.volume -= closed_volume;
                let closed = position.volume.is_zero();

                let mut event = self.position_event(id, &self.positions[&id], "CLOSE");
                event["order2"] = json!(order);
                event["volume"] = json!(closed_volume);
                event["closePrice"] = json!(price);
                event["closeTime"] = json!(Utc::now());
                event["closed"] = json!(closed);
                if closed {
                    self.positions.remove(&id);
                }
                Ok((json!({ "order": order }), vec![event]))
            }
            _ => Err(("BE3", "unsupported transaction type".to_string())),
        }
    }

    /// Move `symbol` one random step and return the quote push.
    fn tick(&mut self, symbol: &str) -> Option<Value> {
        let spec = SYMBOLS.iter().find(|s| s.symbol == symbol)?;
        let mid = self.prices.get_mut(spec.symbol)?;
        let step = rand::thread_rng().gen_range(-3..=3);
        *mid = (*mid + step).max(1);

        let mid = Decimal::new(*mid, spec.precision);
        let half_spread = Decimal::new(1, spec.precision);
        Some(json!({
            "command": "quote",
            "data": {
                "symbol": symbol,
                "bid": mid - half_spread,
                "ask": mid + half_spread,
                "timestamp": Utc::now().timestamp_millis(),
            },
        }))
    }
}

/// Start the simulated venue and return a connector dialling it.
pub fn spawn(tick: Duration) -> LoopbackConnector {
    let (connector, listener) = loopback();
    tokio::spawn(accept_sessions(listener, Arc::new(Mutex::new(VenueState::default())), tick));
    connector
}

async fn accept_sessions(mut listener: LoopbackListener, state: Arc<Mutex<VenueState>>, tick: Duration) {
    while let Some(peer) = listener.accept().await {
        info!("dry-run venue accepted session");
        tokio::spawn(serve(peer, Arc::clone(&state), tick));
    }
}

async fn serve(mut peer: LoopbackPeer, state: Arc<Mutex<VenueState>>, tick: Duration) {
    let lock = || state.lock().unwrap_or_else(PoisonError::into_inner);
    let mut quotes: BTreeSet<String> = BTreeSet::new();
    let mut trades = false;
    let mut ticker = tokio::time::interval(tick);

    loop {
        tokio::select! {
            message = peer.recv_json() => {
                let Some(message) = message else { break };
                let command = message["command"].as_str().unwrap_or_default();
                debug!(command, "dry-run venue request");
                match command {
                    "subscribe" | "unsubscribe" => {
                        let subscribe = command == "subscribe";
                        match message["symbol"].as_str() {
                            Some(symbol) if subscribe => {
                                quotes.insert(symbol.to_string());
                            }
                            Some(symbol) => {
                                quotes.remove(symbol);
                            }
                            None => trades = subscribe,
                        }
                    }
                    "login" => {
                        peer.respond(&message, json!({"streamSessionId": "dry-run"}));
                    }
                    "getAllSymbols" => {
                        let payload = lock().symbols_payload();
                        peer.respond(&message, payload);
                    }
                    "getTrades" => {
                        let payload = lock().open_positions();
                        peer.respond(&message, payload);
                    }
                    "tradeTransaction" => {
                        let result = lock().transact(&message["arguments"]["tradeTransInfo"]);
                        match result {
                            Ok((payload, events)) => {
                                peer.respond(&message, payload);
                                if trades {
                                    peer.send_json(&json!({"command": "trades", "data": events}));
                                }
                            }
                            Err((code, descr)) => {
                                peer.respond_error(&message, code, &descr);
                            }
                        }
                    }
                    _ => {
                        peer.respond_error(&message, "BE0", "unknown command");
                    }
                }
            }
            _ = ticker.tick() => {
                let pushes: Vec<Value> = {
                    let mut venue = lock();
                    quotes.iter().filter_map(|symbol| venue.tick(symbol)).collect()
                };
                for push in pushes {
                    peer.send_json(&push);
                }
            }
        }
    }
    debug!("dry-run venue session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tradebridge_brokers_common::{Credentials, HubConfig, RpcClient, StreamTransport, TransportConfig};
    use tradebridge_brokers_synthetic::{BrokerConfig, SyntheticBroker};

    #[test]
    fn test_open_then_partial_and_full_close() {
        let mut state = VenueState::default();
        let (response, events) = state
            .transact(&json!({"cmd": 1, "type": 0, "symbol": "EURUSD", "volume": "2", "price": "1.085"}))
            .unwrap();
        let id = response["order"].as_u64().unwrap();
        assert_eq!(events[0]["type"], "OPEN");
        assert_eq!(events[0]["cmd"], "sell");

        let (_, events) = state
            .transact(&json!({"cmd": 1, "type": 2, "symbol": "EURUSD", "volume": "0.5", "price": "1.080", "order": id}))
            .unwrap();
        assert_eq!(events[0]["closed"], false);
        assert_eq!(events[0]["volume"], "0.5");

        let (_, events) = state
            .transact(&json!({"cmd": 1, "type": 2, "symbol": "EURUSD", "volume": "5", "price": "1.080", "order": id}))
            .unwrap();
        assert_eq!(events[0]["closed"], true);
        assert_eq!(events[0]["volume"], "1.5");
        assert_eq!(state.open_positions(), json!([]));

        let err = state
            .transact(&json!({"cmd": 0, "type": 2, "volume": "1", "price": "1", "order": id}))
            .unwrap_err();
        assert_eq!(err.0, "BE9");
    }

    #[test]
    fn test_tick_respects_precision() {
        let mut state = VenueState::default();
        let push = state.tick("USDJPY").unwrap();
        let bid: Decimal = serde_json::from_value(push["data"]["bid"].clone()).unwrap();
        let ask: Decimal = serde_json::from_value(push["data"]["ask"].clone()).unwrap();
        assert_eq!(ask - bid, dec!(0.002));
        assert!(state.tick("NOPE").is_none());
    }

    #[tokio::test]
    async fn test_broker_runs_against_dry_run_venue() {
        let connector = spawn(Duration::from_millis(10));
        let transport = StreamTransport::new(Arc::new(connector), TransportConfig::default());
        let broker = SyntheticBroker::new(
            RpcClient::new(transport),
            HubConfig {
                command_spacing_ms: 0,
                ..Default::default()
            },
            BrokerConfig::default(),
        );
        let credentials = Credentials {
            user: "demo".to_string(),
            password: "demo".to_string(),
            app_name: None,
        };
        let wait = Duration::from_secs(5);
        tokio::time::timeout(wait, broker.connect(credentials)).await.unwrap().unwrap();
        tokio::time::timeout(wait, broker.wait_synced()).await.unwrap().unwrap();

        let rate = tokio::time::timeout(wait, broker.get_fx_rate("EUR", "JPY"))
            .await
            .unwrap()
            .unwrap();
        assert!(rate > dec!(100));

        // A buy limit far above the market fills on the next tick.
        broker
            .place_synthetic_order("EURUSD", dec!(1), dec!(10), None, None)
            .await
            .unwrap();
        let position = tokio::time::timeout(wait, async {
            loop {
                let position = broker.get_position("EURUSD").await.unwrap();
                if !position.is_flat() {
                    return position;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(position.volume, dec!(1));
        broker.shutdown();
    }
}
