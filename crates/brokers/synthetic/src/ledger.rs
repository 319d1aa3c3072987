//! Net position bookkeeping from raw venue position events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use tracing::debug;
use tradebridge_core::{NetPosition, PositionEvent, PositionEventKind, Side, Trade};

/// One open position as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub position: u64,
    pub order: u64,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub open_time: DateTime<Utc>,
    /// Accumulated swap. Negative values are charges.
    pub swap: Decimal,
}

impl LedgerEntry {
    fn from_event(event: &PositionEvent) -> Self {
        Self {
            position: event.position_id(),
            order: event.order,
            side: event.side,
            volume: event.volume,
            open_price: event.open_price,
            open_time: event.open_time,
            swap: event.swap,
        }
    }

    pub fn signed_volume(&self) -> Decimal {
        self.side.sign() * self.volume
    }

    /// Unrealised profit if the entry were closed at `price`.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.side.sign() * (price - self.open_price) * self.volume
    }

    /// Swap charged so far, positive when the entry costs money to hold.
    pub fn carrying_cost(&self) -> Decimal {
        -self.swap
    }
}

/// Ids remembered per symbol for duplicate suppression.
const HISTORY_LIMIT: usize = 1024;

/// Insertion-ordered set that forgets its oldest members past `limit`.
#[derive(Debug)]
struct RecentSet<T> {
    members: HashSet<T>,
    order: VecDeque<T>,
    limit: usize,
}

impl<T: Copy + Eq + Hash> RecentSet<T> {
    fn new(limit: usize) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    /// Returns `false` if `item` was already present.
    fn insert(&mut self, item: T) -> bool {
        if !self.members.insert(item) {
            return false;
        }
        self.order.push_back(item);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, item: &T) {
        if self.members.remove(item) {
            self.order.retain(|member| member != item);
        }
    }

    fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Closing history of one symbol.
#[derive(Debug)]
struct SymbolHistory {
    /// Positions known to be fully closed. Late OPENs for these are stale.
    closed: RecentSet<u64>,
    /// (position, closing order) pairs already applied.
    closes: RecentSet<(u64, u64)>,
}

impl Default for SymbolHistory {
    fn default() -> Self {
        Self {
            closed: RecentSet::new(HISTORY_LIMIT),
            closes: RecentSet::new(HISTORY_LIMIT),
        }
    }
}

/// Per-symbol open entries rebuilt from the venue's event stream.
///
/// Duplicate suppression only reaches back to the last restatement of a
/// symbol, so replaying a snapshot always yields the snapshot's state.
#[derive(Debug, Default)]
pub struct PositionLedger {
    symbols: BTreeMap<String, Vec<LedgerEntry>>,
    history: HashMap<String, SymbolHistory>,
    trades: VecDeque<Trade>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one pushed batch. A batch whose first event is a snapshot
    /// restates every symbol it mentions.
    pub fn apply_batch(&mut self, events: &[PositionEvent]) {
        let restating = events.first().is_some_and(|event| event.snapshot);
        if restating {
            let symbols: BTreeSet<&str> = events.iter().map(|event| event.symbol.as_str()).collect();
            for symbol in symbols {
                self.clear_symbol(symbol);
            }
        }
        for event in events {
            self.apply(event, restating || event.snapshot);
        }
    }

    pub fn apply_event(&mut self, event: &PositionEvent) {
        self.apply(event, event.snapshot);
    }

    /// Replace the whole ledger with a full listing of open positions.
    /// Symbols absent from the listing end up flat.
    pub fn replace_all(&mut self, events: &[PositionEvent]) {
        self.symbols.clear();
        self.history.clear();
        for event in events {
            self.apply(event, true);
        }
    }

    pub fn position(&self, symbol: &str) -> NetPosition {
        let Some(entries) = self.symbols.get(symbol) else {
            return NetPosition::flat();
        };
        let volume: Decimal = entries.iter().map(LedgerEntry::signed_volume).sum();
        if volume.is_zero() {
            return NetPosition::flat();
        }
        let cost: Decimal = entries
            .iter()
            .map(|entry| entry.signed_volume() * entry.open_price)
            .sum();
        NetPosition {
            volume,
            average_cost: cost.checked_div(volume),
        }
    }

    /// Open entries of `symbol` in arrival order.
    pub fn entries(&self, symbol: &str) -> &[LedgerEntry] {
        self.symbols.get(symbol).map(Vec::as_slice).unwrap_or_default()
    }

    /// Symbols with at least one open entry.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn pop_trade(&mut self) -> Option<Trade> {
        self.trades.pop_front()
    }

    pub fn any_trade(&self) -> bool {
        !self.trades.is_empty()
    }

    fn clear_symbol(&mut self, symbol: &str) {
        self.symbols.remove(symbol);
        self.history.remove(symbol);
    }

    /// Number of remembered closed positions and applied closes for `symbol`.
    pub fn history_len(&self, symbol: &str) -> (usize, usize) {
        self.history
            .get(symbol)
            .map_or((0, 0), |history| (history.closed.len(), history.closes.len()))
    }

    fn apply(&mut self, event: &PositionEvent, restating: bool) {
        let id = event.position_id();
        match event.kind {
            PositionEventKind::Open | PositionEventKind::Modify => self.on_open(event, id, restating),
            PositionEventKind::Delete => {
                self.remove(&event.symbol, id);
            }
            PositionEventKind::Close => self.on_close(event, id, restating),
        }
    }

    fn on_open(&mut self, event: &PositionEvent, id: u64, restating: bool) {
        let entries = self.symbols.entry(event.symbol.clone()).or_default();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.position == id) {
            entry.side = event.side;
            entry.volume = event.volume;
            entry.open_price = event.open_price;
            entry.open_time = event.open_time;
            entry.swap = event.swap;
            return;
        }
        let history = self.history.entry(event.symbol.clone()).or_default();
        if restating {
            history.closed.remove(&id);
        } else if history.closed.contains(&id) {
            debug!(position = id, symbol = %event.symbol, "ignoring open for closed position");
            if entries.is_empty() {
                self.symbols.remove(&event.symbol);
            }
            return;
        }

        entries.push(LedgerEntry::from_event(event));
        if !restating && event.kind == PositionEventKind::Open {
            self.trades.push_back(Trade {
                symbol: event.symbol.clone(),
                id: event.order.to_string(),
                price: event.open_price,
                size: event.signed_volume(),
                commission: event.commission,
                timestamp: event.open_time,
            });
        }
    }

    fn on_close(&mut self, event: &PositionEvent, id: u64, restating: bool) {
        let closing_order = if event.order2 != 0 { event.order2 } else { event.order };
        let history = self.history.entry(event.symbol.clone()).or_default();
        if !history.closes.insert((id, closing_order)) {
            debug!(position = id, order = closing_order, "duplicate close ignored");
            return;
        }

        let fully_closed = match self.find_mut(&event.symbol, id) {
            Some(entry) => {
                entry.volume -= event.volume;
                event.closed || entry.volume <= Decimal::ZERO
            }
            None => event.closed,
        };
        if fully_closed {
            self.remove(&event.symbol, id);
            self.history.entry(event.symbol.clone()).or_default().closed.insert(id);
        }

        if !restating {
            self.trades.push_back(Trade {
                symbol: event.symbol.clone(),
                id: closing_order.to_string(),
                price: event.close_price,
                size: -event.signed_volume(),
                commission: event.commission,
                timestamp: event.close_time.unwrap_or(event.open_time),
            });
        }
    }

    fn find_mut(&mut self, symbol: &str, id: u64) -> Option<&mut LedgerEntry> {
        self.symbols
            .get_mut(symbol)?
            .iter_mut()
            .find(|entry| entry.position == id)
    }

    fn remove(&mut self, symbol: &str, id: u64) -> Option<LedgerEntry> {
        let entries = self.symbols.get_mut(symbol)?;
        let index = entries.iter().position(|entry| entry.position == id)?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            self.symbols.remove(symbol);
        }
        Some(entry)
    }
}
