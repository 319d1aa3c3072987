use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Order / position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Side implied by a signed size. Zero is treated as a buy.
    pub fn from_signed(size: Decimal) -> Self {
        if size < Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Static metadata of a venue instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Currency of the traded asset (base currency for FX pairs).
    pub asset: String,
    /// Currency prices are quoted in.
    pub currency: String,
    /// Units of the asset per lot.
    pub contract_size: Decimal,
    /// Volume increment.
    pub lot_step: Decimal,
    /// Minimum tradable volume.
    pub lot_min: Decimal,
    /// Number of decimals in quoted prices.
    pub precision: u32,
    /// Whether the instrument is a plain currency pair usable for FX conversion.
    pub is_currency_pair: bool,
    pub leverage: Decimal,
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// Top-of-book quote pushed by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Set when the quote is a cached replay rather than a fresh push.
    #[serde(default)]
    pub snapshot: bool,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Ticker presented to the adapter layer: the venue quote widened by
/// resting synthetic orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// A normalized execution record handed to the adapter as trade history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub id: String,
    pub price: Decimal,
    /// Positive for bought volume, negative for sold volume.
    pub size: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Synthetic orders
// ---------------------------------------------------------------------------

/// A client-side limit order emulated against streamed quotes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticOrder {
    pub id: Uuid,
    pub client_id: Option<String>,
    /// Signed size: positive buys, negative sells.
    pub size: Decimal,
    pub price: Decimal,
    pub executed: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyntheticOrder {
    pub fn new(size: Decimal, price: Decimal, client_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id,
            size,
            price,
            executed: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn side(&self) -> Side {
        Side::from_signed(self.size)
    }

    /// Whether the order crosses the given quote: a buy priced at or above
    /// the ask, or a sell priced at or below the bid.
    pub fn crosses(&self, bid: Decimal, ask: Decimal) -> bool {
        match self.side() {
            Side::Buy => self.price >= ask,
            Side::Sell => self.price <= bid,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution commands
// ---------------------------------------------------------------------------

/// A real venue command produced when a synthetic order fills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecCommand {
    /// Open a new position.
    Open {
        symbol: String,
        side: Side,
        volume: Decimal,
        price: Decimal,
    },
    /// Close all or part of an existing position.
    Close {
        symbol: String,
        position: u64,
        /// Side of the position being closed.
        side: Side,
        volume: Decimal,
        price: Decimal,
    },
}

impl ExecCommand {
    pub fn symbol(&self) -> &str {
        match self {
            ExecCommand::Open { symbol, .. } | ExecCommand::Close { symbol, .. } => symbol,
        }
    }

    /// Signed change in net position this command causes.
    pub fn signed_volume(&self) -> Decimal {
        match self {
            ExecCommand::Open { side, volume, .. } => side.sign() * *volume,
            ExecCommand::Close { side, volume, .. } => -side.sign() * *volume,
        }
    }
}

// ---------------------------------------------------------------------------
// Position summary
// ---------------------------------------------------------------------------

/// Net position of one symbol as derived from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetPosition {
    /// Signed net volume.
    pub volume: Decimal,
    /// Average cost basis; `None` when flat.
    pub average_cost: Option<Decimal>,
}

impl NetPosition {
    pub fn flat() -> Self {
        Self {
            volume: Decimal::ZERO,
            average_cost: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.volume.is_zero()
    }
}
