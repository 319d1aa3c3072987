use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tradebridge_brokers_common::{Credentials, HubConfig, QuoteHub, RpcClient};
use tradebridge_core::{BrokerError, Executor, NetPosition, SymbolInfo, SyntheticOrder, Ticker, Trade};
use uuid::Uuid;

use crate::catalog::AssetCatalog;
use crate::emulator::OrderEmulator;
use crate::executor::RpcExecutor;
use crate::fx::{FxRate, FxResolver};
use crate::ledger_service::LedgerHandle;
use crate::policy::ClosePolicy;

/// Configuration for the synthetic broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Order in which opposing positions are closed.
    pub close_policy: ClosePolicy,
    /// Stream channel carrying position events.
    pub trades_channel: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            close_policy: ClosePolicy::Fifo,
            trades_channel: "trades".to_string(),
        }
    }
}

/// Adapter-facing facade over a venue that only streams quotes and raw
/// position events. Resting limit orders, net positions and FX rates are
/// all derived client-side.
pub struct SyntheticBroker {
    rpc: RpcClient,
    hub: QuoteHub,
    catalog: Arc<AssetCatalog>,
    fx: FxResolver,
    ledger: LedgerHandle,
    orders: OrderEmulator,
}

impl SyntheticBroker {
    /// Broker executing through `tradeTransaction` on the same session.
    pub fn new(rpc: RpcClient, hub_config: HubConfig, config: BrokerConfig) -> Self {
        let executor = Arc::new(RpcExecutor::new(rpc.clone()));
        Self::with_executor(rpc, hub_config, config, executor)
    }

    pub fn with_executor(
        rpc: RpcClient,
        hub_config: HubConfig,
        config: BrokerConfig,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let hub = QuoteHub::new(rpc.clone(), hub_config);
        let catalog = Arc::new(AssetCatalog::new(rpc.clone()));
        let fx = FxResolver::new(Arc::clone(&catalog), hub.clone());
        let ledger = LedgerHandle::spawn(rpc.clone(), config.close_policy, config.trades_channel);
        let orders = OrderEmulator::new(hub.clone(), ledger.clone(), executor);
        info!(close_policy = %config.close_policy, "synthetic broker initialized");
        Self {
            rpc,
            hub,
            catalog,
            fx,
            ledger,
            orders,
        }
    }

    /// Log in. Credentials are replayed after every reconnect.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), BrokerError> {
        info!(
            endpoint = %self.rpc.transport().endpoint(),
            user = %credentials.user,
            "connecting to venue"
        );
        self.rpc.login(credentials).await
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn hub(&self) -> &QuoteHub {
        &self.hub
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    pub async fn symbol_info(&self, symbol: &str) -> Result<Arc<SymbolInfo>, BrokerError> {
        self.catalog.get_or_fetch(symbol).await
    }

    // -----------------------------------------------------------------------
    // Positions and trades
    // -----------------------------------------------------------------------

    pub async fn get_position(&self, symbol: &str) -> Result<NetPosition, BrokerError> {
        self.ledger.position(symbol).await
    }

    pub async fn positions(&self) -> Result<Vec<(String, NetPosition)>, BrokerError> {
        self.ledger.positions().await
    }

    /// Wait until open positions have been loaded for the current session.
    pub async fn wait_synced(&self) -> Result<(), BrokerError> {
        self.ledger.wait_synced().await
    }

    pub async fn pop_trade(&self) -> Result<Option<Trade>, BrokerError> {
        self.ledger.pop_trade().await
    }

    pub async fn any_trade(&self) -> Result<bool, BrokerError> {
        self.ledger.any_trade().await
    }

    // -----------------------------------------------------------------------
    // Synthetic orders
    // -----------------------------------------------------------------------

    /// Place, replace (`replace` set, nonzero size) or cancel (`replace`
    /// set, zero size) a synthetic limit order.
    pub async fn place_synthetic_order(
        &self,
        symbol: &str,
        size: Decimal,
        price: Decimal,
        client_id: Option<String>,
        replace: Option<Uuid>,
    ) -> Result<Option<Uuid>, BrokerError> {
        self.catalog.get_or_fetch(symbol).await?;
        self.orders.place(symbol, size, price, client_id, replace).await
    }

    pub async fn cancel(&self, symbol: &str, id: Uuid) -> Result<(), BrokerError> {
        self.orders
            .place(symbol, Decimal::ZERO, Decimal::ZERO, None, Some(id))
            .await
            .map(|_| ())
    }

    pub async fn get_orders(&self, symbol: &str) -> Result<Vec<SyntheticOrder>, BrokerError> {
        self.orders.orders(symbol).await
    }

    /// Quote of `symbol` widened by resting orders. Waits for the first quote.
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, BrokerError> {
        self.catalog.get_or_fetch(symbol).await?;
        self.orders.ticker(symbol).await
    }

    // -----------------------------------------------------------------------
    // FX
    // -----------------------------------------------------------------------

    /// Live rate handle; check [`FxRate::is_ready`] to poll without waiting.
    pub async fn fx_rate(&self, from: &str, to: &str) -> Result<FxRate, BrokerError> {
        self.fx.resolve(from, to).await
    }

    /// Current conversion rate, waiting for every leg to be quoted.
    pub async fn get_fx_rate(&self, from: &str, to: &str) -> Result<Decimal, BrokerError> {
        self.fx.resolve(from, to).await?.wait().await
    }

    pub fn shutdown(&self) {
        info!("shutting down synthetic broker");
        self.rpc.transport().shutdown();
    }
}
