//! Synthetic order book and position netting for venues that expose only
//! streamed quotes and raw position events.

pub mod broker;
pub mod catalog;
pub mod emulator;
pub mod executor;
pub mod fx;
pub mod ledger;
pub mod ledger_service;
pub mod policy;

#[cfg(test)]
mod testing;

pub use broker::{BrokerConfig, SyntheticBroker};
pub use catalog::{AssetCatalog, CatalogSnapshot};
pub use emulator::{Book, OrderEmulator, Trigger};
pub use executor::RpcExecutor;
pub use fx::{find_path, FxLeg, FxPath, FxRate, FxResolver};
pub use ledger::{LedgerEntry, PositionLedger};
pub use ledger_service::{ExecutionPlan, LedgerHandle};
pub use policy::{plan_execution, ClosePolicy};
