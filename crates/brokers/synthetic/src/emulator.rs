//! Client-side limit orders emulated against streamed quotes.
//!
//! Each symbol gets its own book task, created on first use. The task owns
//! the order list and the quote subscription. Crossing orders are queued to
//! the book's execution task, which plans and executes them one at a time so
//! every plan sees the volume reserved by the ones before it. A slow venue
//! never holds up quote processing.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tradebridge_brokers_common::{QuoteHub, QuoteSubscription};
use tradebridge_core::{BrokerError, Executor, Quote, Side, SyntheticOrder, Ticker};
use uuid::Uuid;

use crate::ledger_service::LedgerHandle;

// ---------------------------------------------------------------------------
// Book state
// ---------------------------------------------------------------------------

struct RestingOrder {
    order: SyntheticOrder,
    /// Bumped on every replace so results of an older arming are dropped.
    arm: u64,
}

/// An order that crossed the quote and must be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub id: Uuid,
    pub arm: u64,
    /// Signed size.
    pub size: Decimal,
    /// Crossing quote price: ask for buys, bid for sells.
    pub price: Decimal,
}

/// Orders and latest quote of one symbol.
pub struct Book {
    symbol: String,
    orders: Vec<RestingOrder>,
    quote: Option<Quote>,
}

impl Book {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            orders: Vec::new(),
            quote: None,
        }
    }

    /// Create, replace or remove an order.
    ///
    /// With `replace` and a nonzero size the order is updated and re-armed.
    /// A zero size removes it. Without `replace` a new order is created.
    /// Returns the id of the live order, if any.
    pub fn place(
        &mut self,
        size: Decimal,
        price: Decimal,
        client_id: Option<String>,
        replace: Option<Uuid>,
    ) -> Result<Option<Uuid>, BrokerError> {
        let Some(id) = replace else {
            if size.is_zero() {
                return Ok(None);
            }
            let order = SyntheticOrder::new(size, price, client_id);
            let id = order.id;
            debug!(symbol = %self.symbol, order = %id, size = %size, price = %price, "synthetic order placed");
            self.orders.push(RestingOrder { order, arm: 0 });
            return Ok(Some(id));
        };

        let index = self
            .orders
            .iter()
            .position(|resting| resting.order.id == id)
            .ok_or(BrokerError::OrderNotFound(id))?;

        if size.is_zero() {
            self.orders.remove(index);
            debug!(symbol = %self.symbol, order = %id, "synthetic order removed");
            return Ok(None);
        }

        let resting = &mut self.orders[index];
        resting.arm += 1;
        let order = &mut resting.order;
        order.size = size;
        order.price = price;
        if client_id.is_some() {
            order.client_id = client_id;
        }
        order.executed = false;
        order.last_error = None;
        order.updated_at = Utc::now();
        debug!(symbol = %self.symbol, order = %id, size = %size, price = %price, "synthetic order replaced");
        Ok(Some(id))
    }

    pub fn orders(&self) -> Vec<SyntheticOrder> {
        self.orders.iter().map(|resting| resting.order.clone()).collect()
    }

    /// Record a quote and mark every armed order that crosses it executed.
    pub fn on_quote(&mut self, quote: Quote) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        for resting in &mut self.orders {
            let order = &mut resting.order;
            if order.executed || !order.crosses(quote.bid, quote.ask) {
                continue;
            }
            order.executed = true;
            order.updated_at = Utc::now();
            let price = match order.side() {
                Side::Buy => quote.ask,
                Side::Sell => quote.bid,
            };
            triggers.push(Trigger {
                id: order.id,
                arm: resting.arm,
                size: order.size,
                price,
            });
        }
        self.quote = Some(quote);
        triggers
    }

    /// Store the outcome of an execution on its order.
    pub fn on_executed(&mut self, id: Uuid, arm: u64, result: Result<(), BrokerError>) {
        let Some(resting) = self
            .orders
            .iter_mut()
            .find(|resting| resting.order.id == id && resting.arm == arm)
        else {
            return;
        };
        resting.order.last_error = result.err().map(|err| err.to_string());
        resting.order.updated_at = Utc::now();
    }

    /// Venue quote widened by resting orders: the bid drops to the lowest
    /// resting buy and the ask rises to the highest resting sell.
    pub fn ticker(&self) -> Option<Ticker> {
        let quote = self.quote.as_ref()?;
        let mut bid = quote.bid;
        let mut ask = quote.ask;
        for resting in self.orders.iter().filter(|resting| !resting.order.executed) {
            let order = &resting.order;
            match order.side() {
                Side::Buy => bid = bid.min(order.price),
                Side::Sell => ask = ask.max(order.price),
            }
        }
        Some(Ticker {
            symbol: self.symbol.clone(),
            bid,
            ask,
            last: quote.mid(),
            timestamp: quote.timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Book task
// ---------------------------------------------------------------------------

enum BookCommand {
    Place {
        size: Decimal,
        price: Decimal,
        client_id: Option<String>,
        replace: Option<Uuid>,
        reply: oneshot::Sender<Result<Option<Uuid>, BrokerError>>,
    },
    Orders {
        reply: oneshot::Sender<Vec<SyntheticOrder>>,
    },
    Ticker {
        reply: oneshot::Sender<Ticker>,
    },
}

type Execution = (Uuid, u64, Result<(), BrokerError>);

async fn run_book(
    mut book: Book,
    mut quotes: QuoteSubscription,
    mut commands: mpsc::UnboundedReceiver<BookCommand>,
    ledger: LedgerHandle,
    executor: Arc<dyn Executor>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Execution>();
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel::<Trigger>();
    tokio::spawn(run_executions(book.symbol.clone(), trigger_rx, ledger, executor, done_tx));
    let mut ticker_waiters: Vec<oneshot::Sender<Ticker>> = Vec::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(BookCommand::Place { size, price, client_id, replace, reply }) => {
                    let _ = reply.send(book.place(size, price, client_id, replace));
                }
                Some(BookCommand::Orders { reply }) => {
                    let _ = reply.send(book.orders());
                }
                Some(BookCommand::Ticker { reply }) => match book.ticker() {
                    Some(ticker) => {
                        let _ = reply.send(ticker);
                    }
                    None => ticker_waiters.push(reply),
                },
                None => break,
            },
            quote = quotes.recv() => match quote {
                Some(quote) => {
                    for trigger in book.on_quote(quote) {
                        info!(
                            symbol = %book.symbol,
                            order = %trigger.id,
                            size = %trigger.size,
                            price = %trigger.price,
                            "synthetic order triggered"
                        );
                        let _ = trigger_tx.send(trigger);
                    }
                    if let Some(ticker) = book.ticker() {
                        for waiter in ticker_waiters.drain(..) {
                            let _ = waiter.send(ticker.clone());
                        }
                    }
                }
                None => break,
            },
            Some((id, arm, result)) = done_rx.recv() => {
                if let Err(err) = &result {
                    warn!(symbol = %book.symbol, order = %id, error = %err, "synthetic order execution failed");
                }
                book.on_executed(id, arm, result);
            }
        }
    }
    debug!(symbol = %book.symbol, "order book stopped");
}

async fn run_executions(
    symbol: String,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    ledger: LedgerHandle,
    executor: Arc<dyn Executor>,
    done: mpsc::UnboundedSender<Execution>,
) {
    while let Some(trigger) = triggers.recv().await {
        let result = execute(&symbol, &trigger, &ledger, &executor).await;
        let _ = done.send((trigger.id, trigger.arm, result));
    }
}

async fn execute(
    symbol: &str,
    trigger: &Trigger,
    ledger: &LedgerHandle,
    executor: &Arc<dyn Executor>,
) -> Result<(), BrokerError> {
    let plan = ledger.plan_execution(symbol, trigger.size, trigger.price).await?;
    for (index, command) in plan.commands.iter().enumerate() {
        if let Err(err) = executor.execute(command.clone()).await {
            ledger.release(plan.id, plan.closes_from(index));
            return Err(err);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Emulator
// ---------------------------------------------------------------------------

/// Routes order and ticker requests to per-symbol book tasks.
pub struct OrderEmulator {
    hub: QuoteHub,
    ledger: LedgerHandle,
    executor: Arc<dyn Executor>,
    books: Mutex<HashMap<String, mpsc::UnboundedSender<BookCommand>>>,
}

impl OrderEmulator {
    pub fn new(hub: QuoteHub, ledger: LedgerHandle, executor: Arc<dyn Executor>) -> Self {
        Self {
            hub,
            ledger,
            executor,
            books: Mutex::new(HashMap::new()),
        }
    }

    pub async fn place(
        &self,
        symbol: &str,
        size: Decimal,
        price: Decimal,
        client_id: Option<String>,
        replace: Option<Uuid>,
    ) -> Result<Option<Uuid>, BrokerError> {
        let book = self.book(symbol);
        let (reply, rx) = oneshot::channel();
        book.send(BookCommand::Place {
            size,
            price,
            client_id,
            replace,
            reply,
        })
        .map_err(|_| book_stopped(symbol))?;
        rx.await.map_err(|_| book_stopped(symbol))?
    }

    /// Orders of `symbol`. Does not open a book that does not exist yet.
    pub async fn orders(&self, symbol: &str) -> Result<Vec<SyntheticOrder>, BrokerError> {
        let Some(book) = self.existing(symbol) else {
            return Ok(Vec::new());
        };
        let (reply, rx) = oneshot::channel();
        book.send(BookCommand::Orders { reply })
            .map_err(|_| book_stopped(symbol))?;
        rx.await.map_err(|_| book_stopped(symbol))
    }

    /// Widened ticker of `symbol`. Waits for the first quote.
    pub async fn ticker(&self, symbol: &str) -> Result<Ticker, BrokerError> {
        let book = self.book(symbol);
        let (reply, rx) = oneshot::channel();
        book.send(BookCommand::Ticker { reply })
            .map_err(|_| book_stopped(symbol))?;
        rx.await.map_err(|_| book_stopped(symbol))
    }

    fn existing(&self, symbol: &str) -> Option<mpsc::UnboundedSender<BookCommand>> {
        let books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
        books.get(symbol).filter(|book| !book.is_closed()).cloned()
    }

    fn book(&self, symbol: &str) -> mpsc::UnboundedSender<BookCommand> {
        let mut books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(book) = books.get(symbol).filter(|book| !book.is_closed()) {
            return book.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_book(
            Book::new(symbol),
            self.hub.subscribe(symbol),
            rx,
            self.ledger.clone(),
            Arc::clone(&self.executor),
        ));
        debug!(symbol, "order book opened");
        books.insert(symbol.to_string(), tx.clone());
        tx
    }
}

fn book_stopped(symbol: &str) -> BrokerError {
    BrokerError::Other(format!("order book for {} stopped", symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ClosePolicy;
    use crate::testing::{accept, expect_command, push_quote, venue, WAIT};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::time::timeout;
    use tradebridge_brokers_common::HubConfig;
    use tradebridge_core::ExecCommand;

    #[derive(Default)]
    struct RecordingExecutor {
        commands: Mutex<Vec<ExecCommand>>,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, command: ExecCommand) -> Result<(), BrokerError> {
            self.commands.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn quote(bid: Decimal, ask: Decimal) -> Quote {
        Quote {
            symbol: "US500".to_string(),
            bid,
            ask,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            snapshot: false,
        }
    }

    #[test]
    fn test_sell_triggers_only_when_bid_reaches_limit() {
        let mut book = Book::new("US500");
        let id = book.place(dec!(-5), dec!(100), None, None).unwrap().unwrap();

        assert!(book.on_quote(quote(dec!(98), dec!(100.5))).is_empty());

        let triggers = book.on_quote(quote(dec!(100), dec!(102)));
        assert_eq!(
            triggers,
            vec![Trigger {
                id,
                arm: 0,
                size: dec!(-5),
                price: dec!(100),
            }]
        );
        assert!(book.orders()[0].executed);
    }

    #[test]
    fn test_executes_at_most_once_until_replaced() {
        let mut book = Book::new("US500");
        let id = book.place(dec!(2), dec!(101), Some("c-1".into()), None).unwrap().unwrap();

        assert_eq!(book.on_quote(quote(dec!(100), dec!(101))).len(), 1);
        assert!(book.on_quote(quote(dec!(99), dec!(100))).is_empty());

        book.on_executed(id, 0, Err(BrokerError::Other("rejected".into())));
        assert_eq!(book.orders()[0].last_error.as_deref(), Some("Broker error: rejected"));
        assert!(book.on_quote(quote(dec!(99), dec!(100))).is_empty());

        assert_eq!(book.place(dec!(3), dec!(101), None, Some(id)).unwrap(), Some(id));
        let order = &book.orders()[0];
        assert!(!order.executed);
        assert!(order.last_error.is_none());
        assert_eq!(order.client_id.as_deref(), Some("c-1"));

        let triggers = book.on_quote(quote(dec!(99), dec!(100)));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].arm, 1);
        assert_eq!(triggers[0].price, dec!(100));

        // A late result for the first arming is ignored.
        book.on_executed(id, 0, Err(BrokerError::Other("stale".into())));
        assert!(book.orders()[0].last_error.is_none());
    }

    #[test]
    fn test_place_remove_and_unknown_replace() {
        let mut book = Book::new("US500");
        let id = book.place(dec!(1), dec!(90), None, None).unwrap().unwrap();
        assert_eq!(book.place(Decimal::ZERO, dec!(90), None, None).unwrap(), None);
        assert_eq!(book.orders().len(), 1);

        let unknown = Uuid::new_v4();
        assert_eq!(
            book.place(dec!(1), dec!(90), None, Some(unknown)),
            Err(BrokerError::OrderNotFound(unknown))
        );

        assert_eq!(book.place(Decimal::ZERO, Decimal::ZERO, None, Some(id)).unwrap(), None);
        assert!(book.orders().is_empty());
    }

    #[test]
    fn test_ticker_widened_by_resting_orders() {
        let mut book = Book::new("US500");
        assert!(book.ticker().is_none());

        book.place(dec!(1), dec!(95), None, None).unwrap();
        book.place(dec!(1), dec!(97), None, None).unwrap();
        book.place(dec!(-1), dec!(110), None, None).unwrap();
        book.on_quote(quote(dec!(99), dec!(101)));

        let ticker = book.ticker().unwrap();
        assert_eq!(ticker.bid, dec!(95));
        assert_eq!(ticker.ask, dec!(110));
        assert_eq!(ticker.last, dec!(100));
    }

    #[test]
    fn test_ticker_ignores_orders_inside_spread() {
        let mut book = Book::new("US500");
        book.place(dec!(1), dec!(99.5), None, None).unwrap();
        book.on_quote(quote(dec!(99), dec!(101)));

        let ticker = book.ticker().unwrap();
        assert_eq!(ticker.bid, dec!(99));
        assert_eq!(ticker.ask, dec!(101));
    }

    #[tokio::test]
    async fn test_orders_triggered_on_one_tick_do_not_close_twice() {
        let (rpc, mut listener) = venue();
        let ledger = LedgerHandle::spawn(rpc.clone(), ClosePolicy::Fifo, "trades");
        let hub = QuoteHub::new(
            rpc.clone(),
            HubConfig {
                command_spacing_ms: 0,
                ..Default::default()
            },
        );
        let executor = Arc::new(RecordingExecutor::default());
        let emulator = OrderEmulator::new(hub, ledger.clone(), executor.clone());

        rpc.transport().connect();
        let mut peer = accept(&mut listener).await;
        let request = expect_command(&mut peer, "getTrades").await;
        peer.respond(
            &request,
            json!([{
                "order": 1, "position": 1, "symbol": "US500", "cmd": "buy",
                "openPrice": "95", "volume": "5", "openTime": "2024-05-01T10:00:00Z",
                "type": "OPEN", "snapshot": false, "closed": false,
            }]),
        );
        timeout(WAIT, ledger.wait_synced()).await.unwrap().unwrap();

        emulator.place("US500", dec!(-5), dec!(100), None, None).await.unwrap();
        emulator.place("US500", dec!(-5), dec!(100), None, None).await.unwrap();
        while expect_command(&mut peer, "subscribe").await["symbol"] != "US500" {}
        push_quote(&peer, "US500", "100", "101");

        timeout(WAIT, async {
            while executor.commands.lock().unwrap().len() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let commands = executor.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                ExecCommand::Close {
                    symbol: "US500".to_string(),
                    position: 1,
                    side: Side::Buy,
                    volume: dec!(5),
                    price: dec!(100),
                },
                ExecCommand::Open {
                    symbol: "US500".to_string(),
                    side: Side::Sell,
                    volume: dec!(5),
                    price: dec!(100),
                },
            ]
        );
        let orders = emulator.orders("US500").await.unwrap();
        assert!(orders.iter().all(|order| order.executed && order.last_error.is_none()));
    }
}
