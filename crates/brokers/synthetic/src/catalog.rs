//! Lazily loaded instrument metadata.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use tradebridge_brokers_common::RpcClient;
use tradebridge_core::{BrokerError, SymbolInfo};

/// Category name the venue uses for plain currency pairs.
const FX_CATEGORY: &str = "FX";

/// Immutable view of the catalog at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    symbols: BTreeMap<String, Arc<SymbolInfo>>,
    fetched_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    pub fn from_symbols(symbols: impl IntoIterator<Item = SymbolInfo>) -> Self {
        Self {
            symbols: symbols
                .into_iter()
                .map(|info| (info.symbol.clone(), Arc::new(info)))
                .collect(),
            fetched_at: Some(Utc::now()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Arc<SymbolInfo>> {
        self.symbols.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    /// All instruments in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SymbolInfo>> {
        self.symbols.values()
    }

    /// Currency-pair instruments in symbol order.
    pub fn currency_pairs(&self) -> impl Iterator<Item = &Arc<SymbolInfo>> {
        self.symbols.values().filter(|info| info.is_currency_pair)
    }

    /// The currency pair trading `asset` against `currency`, if listed.
    pub fn find_combination(&self, asset: &str, currency: &str) -> Option<&Arc<SymbolInfo>> {
        self.currency_pairs()
            .find(|info| info.asset == asset && info.currency == currency)
    }
}

/// Symbol record as returned by `getAllSymbols`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolRecord {
    symbol: String,
    currency: String,
    #[serde(default)]
    currency_profit: Option<String>,
    #[serde(default = "default_one")]
    contract_size: Decimal,
    #[serde(default = "default_step")]
    lot_step: Decimal,
    #[serde(default)]
    lot_min: Option<Decimal>,
    #[serde(default)]
    precision: u32,
    #[serde(default)]
    category_name: String,
    #[serde(default = "default_one")]
    leverage: Decimal,
}

fn default_one() -> Decimal {
    Decimal::ONE
}

fn default_step() -> Decimal {
    Decimal::new(1, 2)
}

impl From<SymbolRecord> for SymbolInfo {
    fn from(record: SymbolRecord) -> Self {
        let currency = record
            .currency_profit
            .unwrap_or_else(|| record.currency.clone());
        SymbolInfo {
            is_currency_pair: record.category_name.eq_ignore_ascii_case(FX_CATEGORY),
            symbol: record.symbol,
            asset: record.currency,
            currency,
            contract_size: record.contract_size,
            lot_min: record.lot_min.unwrap_or(record.lot_step),
            lot_step: record.lot_step,
            precision: record.precision,
            leverage: record.leverage,
        }
    }
}

/// Decode a `getAllSymbols` payload into a snapshot.
pub fn parse_symbols(data: serde_json::Value) -> Result<CatalogSnapshot, BrokerError> {
    let records: Vec<SymbolRecord> = serde_json::from_value(data)?;
    Ok(CatalogSnapshot::from_symbols(records.into_iter().map(SymbolInfo::from)))
}

/// Instrument metadata cache backed by the venue RPC.
///
/// Empty until first use. Each [`update`](Self::update) swaps in a new
/// snapshot, so readers always see a consistent catalog.
pub struct AssetCatalog {
    rpc: RpcClient,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    refresh: tokio::sync::Mutex<()>,
}

impl AssetCatalog {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Current snapshot. Cheap; holds no lock after returning.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().fetched_at().is_some()
    }

    /// Fetch all instruments and replace the cache.
    pub async fn update(&self) -> Result<Arc<CatalogSnapshot>, BrokerError> {
        let _guard = self.refresh.lock().await;
        self.fetch().await
    }

    /// Load the catalog unless it was loaded before.
    pub async fn ensure_loaded(&self) -> Result<Arc<CatalogSnapshot>, BrokerError> {
        let _guard = self.refresh.lock().await;
        let current = self.snapshot();
        if current.fetched_at().is_some() {
            return Ok(current);
        }
        self.fetch().await
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolInfo>> {
        self.snapshot().get(symbol).cloned()
    }

    /// Look up a symbol, refreshing the catalog once on a miss.
    pub async fn get_or_fetch(&self, symbol: &str) -> Result<Arc<SymbolInfo>, BrokerError> {
        if let Some(info) = self.get(symbol) {
            return Ok(info);
        }
        debug!(symbol, "catalog miss, refreshing");
        self.update()
            .await?
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSymbol(symbol.to_string()))
    }

    pub fn find_combination(&self, asset: &str, currency: &str) -> Option<Arc<SymbolInfo>> {
        self.snapshot().find_combination(asset, currency).cloned()
    }

    async fn fetch(&self) -> Result<Arc<CatalogSnapshot>, BrokerError> {
        let data = self.rpc.call("getAllSymbols", json!({})).await?;
        let snapshot = Arc::new(parse_symbols(data)?);
        info!(symbols = snapshot.len(), "asset catalog updated");
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        Ok(snapshot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::Value;

    pub(crate) fn fx(symbol: &str, asset: &str, currency: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            asset: asset.to_string(),
            currency: currency.to_string(),
            contract_size: dec!(100000),
            lot_step: dec!(0.01),
            lot_min: dec!(0.01),
            precision: 5,
            is_currency_pair: true,
            leverage: dec!(30),
        }
    }

    pub(crate) fn symbols_payload() -> Value {
        json!([
            {"symbol": "EURUSD", "currency": "EUR", "currencyProfit": "USD", "contractSize": 100000,
             "lotStep": "0.01", "lotMin": "0.01", "precision": 5, "categoryName": "FX", "leverage": 30},
            {"symbol": "USDJPY", "currency": "USD", "currencyProfit": "JPY", "contractSize": 100000,
             "lotStep": "0.01", "precision": 3, "categoryName": "FX"},
            {"symbol": "US500", "currency": "USD", "contractSize": 50,
             "lotStep": "0.1", "precision": 1, "categoryName": "IND"}
        ])
    }

    #[test]
    fn test_parse_symbols() {
        let snapshot = parse_symbols(symbols_payload()).unwrap();
        assert_eq!(snapshot.len(), 3);

        let eurusd = snapshot.get("EURUSD").unwrap();
        assert_eq!(eurusd.asset, "EUR");
        assert_eq!(eurusd.currency, "USD");
        assert!(eurusd.is_currency_pair);

        let usdjpy = snapshot.get("USDJPY").unwrap();
        assert_eq!(usdjpy.lot_min, dec!(0.01));
        assert_eq!(usdjpy.leverage, Decimal::ONE);

        let index = snapshot.get("US500").unwrap();
        assert!(!index.is_currency_pair);
        assert_eq!(index.currency, "USD");
    }

    #[test]
    fn test_find_combination_only_matches_currency_pairs() {
        let mut index = fx("USDX", "USD", "EUR");
        index.is_currency_pair = false;
        let snapshot = CatalogSnapshot::from_symbols(vec![fx("EURUSD", "EUR", "USD"), index]);

        assert_eq!(snapshot.find_combination("EUR", "USD").unwrap().symbol, "EURUSD");
        assert!(snapshot.find_combination("USD", "EUR").is_none());
    }
}
