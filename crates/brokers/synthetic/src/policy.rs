use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tradebridge_core::{BrokerError, ExecCommand, Side};

use crate::ledger::LedgerEntry;

/// Order in which opposing entries are consumed when an execution reduces
/// or flips a net position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClosePolicy {
    /// Oldest entry first.
    #[default]
    #[serde(rename = "fifo")]
    Fifo,
    #[serde(rename = "smallest")]
    SmallestFirst,
    #[serde(rename = "most_profitable")]
    MostProfitable,
    #[serde(rename = "least_profitable")]
    LeastProfitable,
    #[serde(rename = "lowest_cost")]
    LowestCarryingCost,
}

impl ClosePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosePolicy::Fifo => "fifo",
            ClosePolicy::SmallestFirst => "smallest",
            ClosePolicy::MostProfitable => "most_profitable",
            ClosePolicy::LeastProfitable => "least_profitable",
            ClosePolicy::LowestCarryingCost => "lowest_cost",
        }
    }

    /// Sort `entries` into consumption order for an execution at `price`.
    /// Ties fall back to open time, then position id.
    pub fn order(&self, entries: &mut [&LedgerEntry], price: Decimal) {
        entries.sort_by(|a, b| self.compare(a, b, price).then_with(|| age(a, b)));
    }

    fn compare(&self, a: &LedgerEntry, b: &LedgerEntry, price: Decimal) -> Ordering {
        match self {
            ClosePolicy::Fifo => Ordering::Equal,
            ClosePolicy::SmallestFirst => a.volume.cmp(&b.volume),
            ClosePolicy::MostProfitable => b.unrealized_pnl(price).cmp(&a.unrealized_pnl(price)),
            ClosePolicy::LeastProfitable => a.unrealized_pnl(price).cmp(&b.unrealized_pnl(price)),
            ClosePolicy::LowestCarryingCost => a.carrying_cost().cmp(&b.carrying_cost()),
        }
    }
}

fn age(a: &LedgerEntry, b: &LedgerEntry) -> Ordering {
    a.open_time
        .cmp(&b.open_time)
        .then_with(|| a.position.cmp(&b.position))
}

impl fmt::Display for ClosePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClosePolicy {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(ClosePolicy::Fifo),
            "smallest" => Ok(ClosePolicy::SmallestFirst),
            "most_profitable" => Ok(ClosePolicy::MostProfitable),
            "least_profitable" => Ok(ClosePolicy::LeastProfitable),
            "lowest_cost" => Ok(ClosePolicy::LowestCarryingCost),
            other => Err(BrokerError::Other(format!("unknown close policy: {}", other))),
        }
    }
}

/// Turn a signed execution into venue commands against the open entries of
/// one symbol.
///
/// Opposite-side entries are closed in policy order until the size is used
/// up; the last one may close partially. Whatever remains opens a new
/// position on the execution side.
pub fn plan_execution(
    symbol: &str,
    entries: &[LedgerEntry],
    size: Decimal,
    price: Decimal,
    policy: ClosePolicy,
) -> Vec<ExecCommand> {
    if size.is_zero() {
        return Vec::new();
    }
    let side = Side::from_signed(size);
    let mut remaining = size.abs();

    let mut opposing: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|entry| entry.side == side.opposite() && entry.volume > Decimal::ZERO)
        .collect();
    policy.order(&mut opposing, price);

    let mut commands = Vec::new();
    for entry in opposing {
        if remaining.is_zero() {
            break;
        }
        let volume = remaining.min(entry.volume);
        commands.push(ExecCommand::Close {
            symbol: symbol.to_string(),
            position: entry.position,
            side: entry.side,
            volume,
            price,
        });
        remaining -= volume;
    }

    if remaining > Decimal::ZERO {
        commands.push(ExecCommand::Open {
            symbol: symbol.to_string(),
            side,
            volume: remaining,
            price,
        });
    }
    commands
}
