//! Ledger actor: feeds venue trade pushes into a [`PositionLedger`] and
//! answers queries from the broker facade and the order emulator.

use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use tradebridge_brokers_common::{RpcClient, SessionEvent};
use tradebridge_core::{BrokerError, ExecCommand, NetPosition, PositionEvent, PositionEventKind, Trade};

use crate::ledger::{LedgerEntry, PositionLedger};
use crate::policy::{plan_execution, ClosePolicy};

enum LedgerRequest {
    Position {
        symbol: String,
        reply: oneshot::Sender<NetPosition>,
    },
    Plan {
        symbol: String,
        size: Decimal,
        price: Decimal,
        reply: oneshot::Sender<ExecutionPlan>,
    },
    Release {
        plan: u64,
        positions: Vec<u64>,
    },
    Entries {
        symbol: String,
        reply: oneshot::Sender<Vec<LedgerEntry>>,
    },
    Positions {
        reply: oneshot::Sender<Vec<(String, NetPosition)>>,
    },
    PopTrade {
        reply: oneshot::Sender<Option<Trade>>,
    },
    AnyTrade {
        reply: oneshot::Sender<bool>,
    },
}

/// Venue commands for one execution. Close volume in `commands` stays
/// reserved until the venue reports the close or the plan is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub id: u64,
    pub commands: Vec<ExecCommand>,
}

impl ExecutionPlan {
    /// Positions closed by `commands[from..]`.
    pub fn closes_from(&self, from: usize) -> Vec<u64> {
        self.commands
            .iter()
            .skip(from)
            .filter_map(|command| match command {
                ExecCommand::Close { position, .. } => Some(*position),
                ExecCommand::Open { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug)]
struct Reservation {
    plan: u64,
    symbol: String,
    position: u64,
    volume: Decimal,
}

/// Close volume planned against venue positions but not yet confirmed.
#[derive(Debug, Default)]
struct Reservations {
    next_plan: u64,
    held: Vec<Reservation>,
}

impl Reservations {
    /// `entries` with reserved volume taken off. Fully reserved entries are dropped.
    fn available(&self, entries: &[LedgerEntry]) -> Vec<LedgerEntry> {
        entries
            .iter()
            .filter_map(|entry| {
                let reserved: Decimal = self
                    .held
                    .iter()
                    .filter(|held| held.position == entry.position)
                    .map(|held| held.volume)
                    .sum();
                let mut entry = entry.clone();
                entry.volume -= reserved;
                (entry.volume > Decimal::ZERO).then_some(entry)
            })
            .collect()
    }

    fn hold(&mut self, symbol: &str, commands: &[ExecCommand]) -> u64 {
        self.next_plan += 1;
        for command in commands {
            if let ExecCommand::Close { position, volume, .. } = command {
                self.held.push(Reservation {
                    plan: self.next_plan,
                    symbol: symbol.to_string(),
                    position: *position,
                    volume: *volume,
                });
            }
        }
        self.next_plan
    }

    fn release(&mut self, plan: u64, positions: &[u64]) {
        self.held
            .retain(|held| held.plan != plan || !positions.contains(&held.position));
    }

    /// Settle reservations against closes reported by the venue, oldest first.
    fn confirm(&mut self, batch: &[PositionEvent]) {
        for event in batch {
            let position = event.position_id();
            match event.kind {
                PositionEventKind::Close => {
                    let mut reported = event.volume;
                    for held in self.held.iter_mut().filter(|held| held.position == position) {
                        let settled = reported.min(held.volume);
                        held.volume -= settled;
                        reported -= settled;
                    }
                    self.held.retain(|held| held.volume > Decimal::ZERO);
                }
                PositionEventKind::Delete => self.held.retain(|held| held.position != position),
                PositionEventKind::Open | PositionEventKind::Modify => {}
            }
        }
    }

    /// Drop reservations on positions the ledger no longer holds.
    fn retain_open(&mut self, ledger: &PositionLedger) {
        self.held.retain(|held| {
            ledger
                .entries(&held.symbol)
                .iter()
                .any(|entry| entry.position == held.position)
        });
    }

    fn clear(&mut self) {
        self.held.clear();
    }

    fn len(&self) -> usize {
        self.held.len()
    }
}

/// Clonable handle to the ledger task.
#[derive(Clone)]
pub struct LedgerHandle {
    requests: mpsc::UnboundedSender<LedgerRequest>,
    synced: watch::Receiver<bool>,
}

impl LedgerHandle {
    /// Start the ledger task. It resyncs from `getTrades` and subscribes to
    /// `trades_channel` every time the session becomes ready.
    pub fn spawn(rpc: RpcClient, policy: ClosePolicy, trades_channel: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sessions = rpc.sessions();
        let (synced_tx, synced) = watch::channel(false);
        let task = LedgerTask {
            rpc,
            policy,
            channel: trades_channel.into(),
            ledger: PositionLedger::new(),
            reservations: Reservations::default(),
            generation: 0,
            resyncing: false,
            buffered: Vec::new(),
            synced: synced_tx,
        };
        tokio::spawn(task.run(rx, sessions));
        Self { requests: tx, synced }
    }

    /// Wait until the ledger has been resynced for the current session.
    pub async fn wait_synced(&self) -> Result<(), BrokerError> {
        let mut synced = self.synced.clone();
        synced
            .wait_for(|synced| *synced)
            .await
            .map(|_| ())
            .map_err(|_| BrokerError::Other("ledger stopped".to_string()))
    }

    pub async fn position(&self, symbol: &str) -> Result<NetPosition, BrokerError> {
        self.ask(|reply| LedgerRequest::Position {
            symbol: symbol.to_string(),
            reply,
        })
        .await
    }

    /// Venue commands realising a signed execution of `size` at `price`.
    /// Volume reserved by earlier plans is not closed again.
    pub async fn plan_execution(&self, symbol: &str, size: Decimal, price: Decimal) -> Result<ExecutionPlan, BrokerError> {
        self.ask(|reply| LedgerRequest::Plan {
            symbol: symbol.to_string(),
            size,
            price,
            reply,
        })
        .await
    }

    /// Return the reservations of `plan` on `positions` after its commands
    /// were not carried out.
    pub fn release(&self, plan: u64, positions: Vec<u64>) {
        if positions.is_empty() {
            return;
        }
        let _ = self.requests.send(LedgerRequest::Release { plan, positions });
    }

    pub async fn entries(&self, symbol: &str) -> Result<Vec<LedgerEntry>, BrokerError> {
        self.ask(|reply| LedgerRequest::Entries {
            symbol: symbol.to_string(),
            reply,
        })
        .await
    }

    /// Net positions of every symbol with open entries.
    pub async fn positions(&self) -> Result<Vec<(String, NetPosition)>, BrokerError> {
        self.ask(|reply| LedgerRequest::Positions { reply }).await
    }

    pub async fn pop_trade(&self) -> Result<Option<Trade>, BrokerError> {
        self.ask(|reply| LedgerRequest::PopTrade { reply }).await
    }

    pub async fn any_trade(&self) -> Result<bool, BrokerError> {
        self.ask(|reply| LedgerRequest::AnyTrade { reply }).await
    }

    async fn ask<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> LedgerRequest) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(request(reply))
            .map_err(|_| BrokerError::Other("ledger stopped".to_string()))?;
        rx.await
            .map_err(|_| BrokerError::Other("ledger stopped".to_string()))
    }
}

type Resync = (u64, Result<Vec<PositionEvent>, BrokerError>);

struct LedgerTask {
    rpc: RpcClient,
    policy: ClosePolicy,
    channel: String,
    ledger: PositionLedger,
    reservations: Reservations,
    /// Bumped per session so a resync from a dead session is discarded.
    generation: u64,
    resyncing: bool,
    /// Pushes received while a resync is in flight.
    buffered: Vec<Vec<PositionEvent>>,
    synced: watch::Sender<bool>,
}

impl LedgerTask {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<LedgerRequest>,
        mut sessions: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (resync_tx, mut resync_rx) = mpsc::unbounded_channel::<Resync>();

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                event = sessions.recv() => match event {
                    Some(SessionEvent::Ready) => self.on_ready(&resync_tx),
                    Some(SessionEvent::Lost(reason)) => {
                        debug!(reason = %reason, "ledger session lost");
                        self.generation += 1;
                        self.resyncing = false;
                        self.buffered.clear();
                        self.synced.send_replace(false);
                    }
                    Some(SessionEvent::Push(value)) => self.on_push(&value),
                    None => break,
                },
                Some((generation, result)) = resync_rx.recv() => {
                    if generation == self.generation {
                        self.on_resync(result);
                    }
                }
            }
        }
        debug!("ledger task stopped");
    }

    fn on_request(&mut self, request: LedgerRequest) {
        match request {
            LedgerRequest::Position { symbol, reply } => {
                let _ = reply.send(self.ledger.position(&symbol));
            }
            LedgerRequest::Plan {
                symbol,
                size,
                price,
                reply,
            } => {
                let available = self.reservations.available(self.ledger.entries(&symbol));
                let commands = plan_execution(&symbol, &available, size, price, self.policy);
                let id = self.reservations.hold(&symbol, &commands);
                let _ = reply.send(ExecutionPlan { id, commands });
            }
            LedgerRequest::Release { plan, positions } => {
                self.reservations.release(plan, &positions);
            }
            LedgerRequest::Entries { symbol, reply } => {
                let _ = reply.send(self.ledger.entries(&symbol).to_vec());
            }
            LedgerRequest::Positions { reply } => {
                let positions = self
                    .ledger
                    .symbols()
                    .map(|symbol| (symbol.to_string(), self.ledger.position(symbol)))
                    .collect();
                let _ = reply.send(positions);
            }
            LedgerRequest::PopTrade { reply } => {
                let _ = reply.send(self.ledger.pop_trade());
            }
            LedgerRequest::AnyTrade { reply } => {
                let _ = reply.send(self.ledger.any_trade());
            }
        }
    }

    fn on_ready(&mut self, resync_tx: &mpsc::UnboundedSender<Resync>) {
        self.generation += 1;
        self.resyncing = true;
        self.buffered.clear();
        self.synced.send_replace(false);

        if let Err(err) = self.rpc.notify(&json!({"command": "subscribe", "channel": self.channel})) {
            warn!(error = %err, channel = %self.channel, "failed to subscribe to trade stream");
        }

        let rpc = self.rpc.clone();
        let generation = self.generation;
        let resync_tx = resync_tx.clone();
        tokio::spawn(async move {
            let result = match rpc.call("getTrades", json!({"openedOnly": true})).await {
                Ok(data) => serde_json::from_value(data).map_err(BrokerError::from),
                Err(err) => Err(err),
            };
            let _ = resync_tx.send((generation, result));
        });
    }

    fn on_resync(&mut self, result: Result<Vec<PositionEvent>, BrokerError>) {
        self.resyncing = false;
        match result {
            Ok(events) => {
                self.ledger.replace_all(&events);
                // The listing already reflects every acknowledged close.
                self.reservations.clear();
                info!(positions = events.len(), "ledger resynced");
            }
            Err(err) => warn!(error = %err, "ledger resync failed, keeping previous state"),
        }
        for batch in std::mem::take(&mut self.buffered) {
            self.apply(&batch);
        }
        self.synced.send_replace(true);
    }

    fn on_push(&mut self, value: &Arc<Value>) {
        if value.get("command").and_then(Value::as_str) != Some("trades") {
            return;
        }
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let batch: Vec<PositionEvent> = match serde_json::from_value(data) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "malformed trades push");
                return;
            }
        };
        if self.resyncing {
            self.buffered.push(batch);
        } else {
            self.apply(&batch);
        }
    }

    fn apply(&mut self, batch: &[PositionEvent]) {
        self.ledger.apply_batch(batch);
        self.reservations.confirm(batch);
        self.reservations.retain_open(&self.ledger);
        debug!(reserved = self.reservations.len(), "trades batch applied");
    }
}
