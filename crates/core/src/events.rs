use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Side;

/// Kind of a venue position event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionEventKind {
    Open,
    Close,
    Modify,
    Delete,
}

/// A raw position/trade event pushed by the venue.
///
/// Events arrive in batches. A batch whose first event carries
/// `snapshot = true` is a full restatement of every symbol it mentions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEvent {
    /// Order that produced this event.
    pub order: u64,
    /// Secondary order (the closing order on CLOSE events).
    #[serde(default)]
    pub order2: u64,
    /// Position the event belongs to. Zero means "same as `order`".
    #[serde(default)]
    pub position: u64,
    pub symbol: String,
    #[serde(rename = "cmd")]
    pub side: Side,
    pub open_price: Decimal,
    #[serde(default)]
    pub close_price: Decimal,
    pub volume: Decimal,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commission: Decimal,
    /// Accumulated carrying cost (swap/storage).
    #[serde(default)]
    pub swap: Decimal,
    #[serde(rename = "type")]
    pub kind: PositionEventKind,
    #[serde(default)]
    pub snapshot: bool,
    #[serde(default)]
    pub closed: bool,
}

impl PositionEvent {
    /// Identifier of the position this event refers to.
    pub fn position_id(&self) -> u64 {
        if self.position != 0 {
            self.position
        } else {
            self.order
        }
    }

    /// Volume signed by the event side.
    pub fn signed_volume(&self) -> Decimal {
        self.side.sign() * self.volume
    }
}
