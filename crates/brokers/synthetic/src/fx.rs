//! Transitive FX conversion over the venue's currency pairs.
//!
//! A path is found by a breadth-first walk from the target currency back to
//! the source, exploring pairs in symbol order. The live rate is the product
//! of every leg's mid price, inverted where the walk runs against the pair.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tradebridge_brokers_common::{QuoteHub, QuoteSubscription};
use tradebridge_core::BrokerError;

use crate::catalog::{AssetCatalog, CatalogSnapshot};

/// One conversion step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FxLeg {
    pub symbol: String,
    /// Use `1 / price` instead of `price`.
    pub invert: bool,
}

/// Ordered legs converting `from` into `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FxPath {
    pub from: String,
    pub to: String,
    pub legs: Vec<FxLeg>,
}

/// Shortest chain of currency pairs converting `from` into `to`.
///
/// Equally short paths are resolved by symbol order. Returns an empty path
/// for identical currencies and `None` when the currencies are not joined.
pub fn find_path(catalog: &CatalogSnapshot, from: &str, to: &str) -> Option<FxPath> {
    if from == to {
        return Some(FxPath {
            from: from.to_string(),
            to: to.to_string(),
            legs: Vec::new(),
        });
    }

    // currency -> (symbol, next currency towards the target)
    let mut parent: HashMap<String, (String, String)> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::from([to.to_string()]);
    let mut queue = VecDeque::from([to.to_string()]);

    'walk: while let Some(current) = queue.pop_front() {
        for pair in catalog.currency_pairs() {
            let other = if pair.asset == current {
                &pair.currency
            } else if pair.currency == current {
                &pair.asset
            } else {
                continue;
            };
            if !seen.insert(other.clone()) {
                continue;
            }
            parent.insert(other.clone(), (pair.symbol.clone(), current.clone()));
            if other == from {
                break 'walk;
            }
            queue.push_back(other.clone());
        }
    }

    let mut legs = Vec::new();
    let mut currency = from.to_string();
    while currency != to {
        let (symbol, next) = parent.get(&currency)?;
        let pair = catalog.get(symbol)?;
        legs.push(FxLeg {
            symbol: symbol.clone(),
            invert: pair.asset != currency,
        });
        currency = next.clone();
    }

    Some(FxPath {
        from: from.to_string(),
        to: to.to_string(),
        legs,
    })
}

// ---------------------------------------------------------------------------
// Rate composition
// ---------------------------------------------------------------------------

struct ChainNode {
    invert: bool,
    price: Option<Decimal>,
    /// Product of this leg and every leg before it.
    composed: Option<Decimal>,
}

impl ChainNode {
    fn factor(&self) -> Option<Decimal> {
        let price = self.price?;
        if self.invert {
            Decimal::ONE.checked_div(price)
        } else {
            Some(price)
        }
    }
}

/// Partial products along a path. A price change recomputes only the
/// nodes from the changed leg onward.
struct Chain {
    nodes: Vec<ChainNode>,
}

impl Chain {
    fn new(legs: &[FxLeg]) -> Self {
        Self {
            nodes: legs
                .iter()
                .map(|leg| ChainNode {
                    invert: leg.invert,
                    price: None,
                    composed: None,
                })
                .collect(),
        }
    }

    fn update(&mut self, index: usize, price: Decimal) -> Option<Decimal> {
        let Some(node) = self.nodes.get_mut(index) else {
            return self.value();
        };
        node.price = Some(price);

        let mut acc = match index {
            0 => Some(Decimal::ONE),
            _ => self.nodes[index - 1].composed,
        };
        for node in &mut self.nodes[index..] {
            acc = match (acc, node.factor()) {
                (Some(acc), Some(factor)) => acc.checked_mul(factor),
                _ => None,
            };
            node.composed = acc;
        }
        self.value()
    }

    fn value(&self) -> Option<Decimal> {
        match self.nodes.last() {
            Some(node) => node.composed,
            None => Some(Decimal::ONE),
        }
    }
}

/// A continuously updating conversion rate.
///
/// Clones share the same underlying task, which runs while any clone is
/// alive and the quote hub keeps delivering.
#[derive(Clone)]
pub struct FxRate {
    from: String,
    to: String,
    legs: Arc<[FxLeg]>,
    value: watch::Receiver<Option<Decimal>>,
}

impl FxRate {
    /// Rate between identical currencies.
    pub fn identity(currency: &str) -> Self {
        let (_, value) = watch::channel(Some(Decimal::ONE));
        Self {
            from: currency.to_string(),
            to: currency.to_string(),
            legs: Arc::from(Vec::new()),
            value,
        }
    }

    /// Subscribe to every leg of `path` and start composing.
    pub fn spawn(hub: &QuoteHub, path: FxPath) -> Self {
        let (tx, value) = watch::channel(None);
        let (prices_tx, prices_rx) = mpsc::unbounded_channel();
        for (index, leg) in path.legs.iter().enumerate() {
            tokio::spawn(forward_leg(index, hub.subscribe(&leg.symbol), prices_tx.clone()));
        }
        drop(prices_tx);
        tokio::spawn(run_chain(Chain::new(&path.legs), prices_rx, tx));
        Self {
            from: path.from,
            to: path.to,
            legs: Arc::from(path.legs),
            value,
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn legs(&self) -> &[FxLeg] {
        &self.legs
    }

    /// Whether every leg has produced a price.
    pub fn is_ready(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Latest composed rate, if every leg has a price.
    pub fn value(&self) -> Option<Decimal> {
        *self.value.borrow()
    }

    /// Wait until the rate is available.
    pub async fn wait(&self) -> Result<Decimal, BrokerError> {
        let mut value = self.value.clone();
        loop {
            if let Some(rate) = *value.borrow_and_update() {
                return Ok(rate);
            }
            if value.changed().await.is_err() {
                return Err(BrokerError::FxUnavailable {
                    from: self.from.clone(),
                    to: self.to.clone(),
                });
            }
        }
    }
}

async fn forward_leg(
    index: usize,
    mut quotes: QuoteSubscription,
    prices: mpsc::UnboundedSender<(usize, Decimal)>,
) {
    loop {
        tokio::select! {
            quote = quotes.recv() => match quote {
                Some(quote) => {
                    if prices.send((index, quote.mid())).is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = prices.closed() => return,
        }
    }
}

async fn run_chain(
    mut chain: Chain,
    mut prices: mpsc::UnboundedReceiver<(usize, Decimal)>,
    value: watch::Sender<Option<Decimal>>,
) {
    loop {
        tokio::select! {
            update = prices.recv() => match update {
                Some((index, price)) => {
                    let rate = chain.update(index, price);
                    value.send_if_modified(|current| {
                        if *current != rate {
                            *current = rate;
                            true
                        } else {
                            false
                        }
                    });
                }
                None => break,
            },
            _ = value.closed() => break,
        }
    }
    debug!("fx rate task stopped");
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves and caches live conversion rates.
pub struct FxResolver {
    catalog: Arc<AssetCatalog>,
    hub: QuoteHub,
    rates: Mutex<HashMap<(String, String), FxRate>>,
}

impl FxResolver {
    pub fn new(catalog: Arc<AssetCatalog>, hub: QuoteHub) -> Self {
        Self {
            catalog,
            hub,
            rates: Mutex::new(HashMap::new()),
        }
    }

    /// Live rate converting `from` into `to`. Fails with
    /// [`BrokerError::NoFxPath`] when no chain of pairs joins them.
    pub async fn resolve(&self, from: &str, to: &str) -> Result<FxRate, BrokerError> {
        if from == to {
            return Ok(FxRate::identity(from));
        }
        let key = (from.to_string(), to.to_string());
        if let Some(rate) = self.lock().get(&key) {
            return Ok(rate.clone());
        }

        let catalog = self.catalog.ensure_loaded().await?;
        let path = find_path(&catalog, from, to).ok_or_else(|| BrokerError::NoFxPath {
            from: from.to_string(),
            to: to.to_string(),
        })?;

        let mut rates = self.lock();
        // Another caller may have resolved the same pair meanwhile.
        if let Some(rate) = rates.get(&key) {
            return Ok(rate.clone());
        }
        info!(
            from,
            to,
            legs = ?path.legs.iter().map(|leg| leg.symbol.as_str()).collect::<Vec<_>>(),
            "fx path resolved"
        );
        let rate = FxRate::spawn(&self.hub, path);
        rates.insert(key, rate.clone());
        Ok(rate)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), FxRate>> {
        self.rates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{fx, symbols_payload};
    use crate::testing::{accept, expect_command, push_quote, venue, WAIT};
    use rust_decimal_macros::dec;
    use tokio::time::timeout;
    use tradebridge_brokers_common::HubConfig;

    fn majors() -> CatalogSnapshot {
        CatalogSnapshot::from_symbols(vec![
            fx("EURUSD", "EUR", "USD"),
            fx("USDJPY", "USD", "JPY"),
            fx("GBPUSD", "GBP", "USD"),
            fx("EURGBP", "EUR", "GBP"),
        ])
    }

    fn leg(symbol: &str, invert: bool) -> FxLeg {
        FxLeg {
            symbol: symbol.to_string(),
            invert,
        }
    }

    #[test]
    fn test_direct_pair_direction() {
        let catalog = majors();
        let forward = find_path(&catalog, "USD", "JPY").unwrap();
        assert_eq!(forward.legs, vec![leg("USDJPY", false)]);

        let reverse = find_path(&catalog, "JPY", "USD").unwrap();
        assert_eq!(reverse.legs, vec![leg("USDJPY", true)]);
    }

    #[test]
    fn test_multi_leg_path() {
        let path = find_path(&majors(), "GBP", "JPY").unwrap();
        assert_eq!(path.legs, vec![leg("GBPUSD", false), leg("USDJPY", false)]);

        let path = find_path(&majors(), "JPY", "GBP").unwrap();
        assert_eq!(path.legs, vec![leg("USDJPY", true), leg("GBPUSD", true)]);
    }

    #[test]
    fn test_equal_length_paths_pick_lowest_symbol() {
        // CHF reaches USD through AUD or through CAD. AUDUSD sorts first.
        let catalog = CatalogSnapshot::from_symbols(vec![
            fx("AUDUSD", "AUD", "USD"),
            fx("AUDCHF", "AUD", "CHF"),
            fx("USDCAD", "USD", "CAD"),
            fx("CADCHF", "CAD", "CHF"),
        ]);
        let path = find_path(&catalog, "CHF", "USD").unwrap();
        assert_eq!(path.legs, vec![leg("AUDCHF", true), leg("AUDUSD", false)]);

        // Repeated resolution is stable.
        assert_eq!(find_path(&catalog, "CHF", "USD").unwrap(), path);
    }

    #[test]
    fn test_no_path_and_identity() {
        let catalog = majors();
        assert!(find_path(&catalog, "USD", "PLN").is_none());
        assert!(find_path(&catalog, "USD", "USD").unwrap().legs.is_empty());
    }

    #[test]
    fn test_non_currency_pairs_are_ignored() {
        let mut index = fx("US500", "USD", "PTS");
        index.is_currency_pair = false;
        let catalog = CatalogSnapshot::from_symbols(vec![index]);
        assert!(find_path(&catalog, "USD", "PTS").is_none());
    }

    #[test]
    fn test_chain_waits_for_every_leg() {
        let mut chain = Chain::new(&[leg("GBPUSD", false), leg("USDJPY", false)]);
        assert_eq!(chain.update(1, dec!(150)), None);
        assert_eq!(chain.update(0, dec!(1.25)), Some(dec!(187.50)));
        // Only the suffix moves when the last leg changes.
        assert_eq!(chain.update(1, dec!(160)), Some(dec!(200.00)));
        assert_eq!(chain.nodes[0].composed, Some(dec!(1.25)));
    }

    #[test]
    fn test_reversed_chain_is_reciprocal() {
        let catalog = CatalogSnapshot::from_symbols(vec![fx("USDJPY", "USD", "JPY"), fx("EURUSD", "EUR", "USD")]);
        let prices = HashMap::from([("USDJPY", dec!(160)), ("EURUSD", dec!(1.25))]);

        let rate = |from: &str, to: &str| {
            let path = find_path(&catalog, from, to).unwrap();
            let mut chain = Chain::new(&path.legs);
            let mut value = None;
            for (index, leg) in path.legs.iter().enumerate() {
                value = chain.update(index, prices[leg.symbol.as_str()]);
            }
            value.unwrap()
        };

        let forward = rate("EUR", "JPY");
        let backward = rate("JPY", "EUR");
        assert_eq!(forward, dec!(200));
        assert_eq!(backward, dec!(0.005));
        assert_eq!(forward * backward, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_identity_rate_is_immediately_ready() {
        let rate = FxRate::identity("EUR");
        assert!(rate.is_ready());
        assert_eq!(rate.wait().await.unwrap(), Decimal::ONE);
        assert!(rate.legs().is_empty());
    }

    #[tokio::test]
    async fn test_resolver_composes_live_quotes() {
        let (rpc, mut listener) = venue();
        let hub = QuoteHub::new(
            rpc.clone(),
            HubConfig {
                command_spacing_ms: 0,
                ..Default::default()
            },
        );
        let resolver = Arc::new(FxResolver::new(Arc::new(AssetCatalog::new(rpc)), hub));

        let resolving = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            async move { resolver.resolve("EUR", "JPY").await }
        });
        let mut peer = accept(&mut listener).await;
        let request = expect_command(&mut peer, "getAllSymbols").await;
        peer.respond(&request, symbols_payload());

        let rate = timeout(WAIT, resolving).await.unwrap().unwrap().unwrap();
        assert_eq!(rate.legs(), &[leg("EURUSD", false), leg("USDJPY", false)]);
        assert!(!rate.is_ready());

        let mut subscribed = Vec::new();
        for _ in 0..2 {
            let cmd = expect_command(&mut peer, "subscribe").await;
            subscribed.push(cmd["symbol"].as_str().unwrap().to_string());
        }
        subscribed.sort();
        assert_eq!(subscribed, vec!["EURUSD", "USDJPY"]);

        push_quote(&peer, "EURUSD", "1.2499", "1.2501");
        push_quote(&peer, "USDJPY", "159.99", "160.01");
        let value = timeout(WAIT, async {
            loop {
                let value = rate.wait().await.unwrap();
                if value == dec!(200) {
                    return value;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(value, dec!(200));

        // Cached: resolving again spawns no new subscriptions.
        let again = resolver.resolve("EUR", "JPY").await.unwrap();
        assert_eq!(again.value(), Some(dec!(200)));
    }

    #[tokio::test]
    async fn test_resolver_reports_missing_path() {
        let (rpc, mut listener) = venue();
        let hub = QuoteHub::new(rpc.clone(), HubConfig::default());
        let resolver = Arc::new(FxResolver::new(Arc::new(AssetCatalog::new(rpc)), hub));

        let resolving = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            async move { resolver.resolve("USD", "PLN").await.map(|_| ()) }
        });
        let mut peer = accept(&mut listener).await;
        let request = expect_command(&mut peer, "getAllSymbols").await;
        peer.respond(&request, symbols_payload());

        let err = timeout(WAIT, resolving).await.unwrap().unwrap().unwrap_err();
        assert_eq!(
            err,
            BrokerError::NoFxPath {
                from: "USD".to_string(),
                to: "PLN".to_string()
            }
        );
    }
}
