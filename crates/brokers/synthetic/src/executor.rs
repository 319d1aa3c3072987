use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;
use tradebridge_brokers_common::RpcClient;
use tradebridge_core::{BrokerError, ExecCommand, Executor, Side};

// Venue codes for tradeTransaction.
const CMD_BUY: u8 = 0;
const CMD_SELL: u8 = 1;
const TYPE_OPEN: u8 = 0;
const TYPE_CLOSE: u8 = 2;

/// Executes commands as `tradeTransaction` RPCs on the shared session.
pub struct RpcExecutor {
    rpc: RpcClient,
}

impl RpcExecutor {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

fn side_code(side: Side) -> u8 {
    match side {
        Side::Buy => CMD_BUY,
        Side::Sell => CMD_SELL,
    }
}

/// Arguments of the `tradeTransaction` call for `command`.
pub fn transaction_arguments(command: &ExecCommand) -> Value {
    let info = match command {
        ExecCommand::Open {
            symbol,
            side,
            volume,
            price,
        } => json!({
            "cmd": side_code(*side),
            "type": TYPE_OPEN,
            "symbol": symbol,
            "volume": volume,
            "price": price,
            "order": 0,
        }),
        ExecCommand::Close {
            symbol,
            position,
            side,
            volume,
            price,
        } => json!({
            "cmd": side_code(*side),
            "type": TYPE_CLOSE,
            "symbol": symbol,
            "volume": volume,
            "price": price,
            "order": position,
        }),
    };
    json!({ "tradeTransInfo": info })
}

#[async_trait]
impl Executor for RpcExecutor {
    async fn execute(&self, command: ExecCommand) -> Result<(), BrokerError> {
        let response = self
            .rpc
            .call("tradeTransaction", transaction_arguments(&command))
            .await?;
        let order = response.get("order").cloned().unwrap_or(Value::Null);
        info!(
            symbol = %command.symbol(),
            volume = %command.signed_volume(),
            order = %order,
            "trade transaction accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{accept, expect_command, venue, WAIT};
    use rust_decimal_macros::dec;
    use tokio::time::timeout;

    #[test]
    fn test_close_arguments_reference_position() {
        let args = transaction_arguments(&ExecCommand::Close {
            symbol: "EURUSD".to_string(),
            position: 42,
            side: Side::Sell,
            volume: dec!(0.5),
            price: dec!(1.1),
        });
        let info = &args["tradeTransInfo"];
        assert_eq!(info["cmd"], 1);
        assert_eq!(info["type"], 2);
        assert_eq!(info["order"], 42);
        assert_eq!(info["volume"], "0.5");
    }

    #[tokio::test]
    async fn test_execute_issues_trade_transaction() {
        let (rpc, mut listener) = venue();
        let executor = RpcExecutor::new(rpc);
        let command = ExecCommand::Open {
            symbol: "US500".to_string(),
            side: Side::Buy,
            volume: dec!(2),
            price: dec!(5000),
        };
        let running = tokio::spawn(async move { executor.execute(command).await });

        let mut peer = accept(&mut listener).await;
        let request = expect_command(&mut peer, "tradeTransaction").await;
        assert_eq!(request["arguments"]["tradeTransInfo"]["cmd"], 0);
        assert_eq!(request["arguments"]["tradeTransInfo"]["type"], 0);
        peer.respond_error(&request, "BE4", "Market closed");

        let err = timeout(WAIT, running).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Protocol { ref code, .. } if code == "BE4"));
    }

    #[tokio::test]
    async fn test_accepted_transaction_returns_ok() {
        let (rpc, mut listener) = venue();
        let executor = RpcExecutor::new(rpc);
        let command = ExecCommand::Close {
            symbol: "EURUSD".to_string(),
            position: 7,
            side: Side::Buy,
            volume: dec!(1),
            price: dec!(1.1),
        };
        let running = tokio::spawn(async move { executor.execute(command).await });

        let mut peer = accept(&mut listener).await;
        let request = expect_command(&mut peer, "tradeTransaction").await;
        assert_eq!(request["arguments"]["tradeTransInfo"]["order"], 7);
        peer.respond(&request, json!({"order": 501}));

        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_order_field_is_still_accepted() {
        let (rpc, mut listener) = venue();
        let executor = RpcExecutor::new(rpc);
        let command = ExecCommand::Open {
            symbol: "US500".to_string(),
            side: Side::Sell,
            volume: dec!(1),
            price: dec!(5000),
        };
        let running = tokio::spawn(async move { executor.execute(command).await });

        let mut peer = accept(&mut listener).await;
        let request = expect_command(&mut peer, "tradeTransaction").await;
        peer.respond(&request, json!({}));

        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }
}
