use crate::models::*;
use async_trait::async_trait;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// The session dropped while the request was outstanding.
    #[error("Disconnected: {0}")]
    Disconnected(String),
    #[error("Transport error: {0}")]
    Transport(String),
    /// The venue answered the request with a structured error.
    #[error("Protocol error {code}: {message}")]
    Protocol { code: String, message: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("No conversion path from {from} to {to}")]
    NoFxPath { from: String, to: String },
    /// The rate exists but can no longer produce a value.
    #[error("FX rate {from}/{to} unavailable")]
    FxUnavailable { from: String, to: String },
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the error was caused by the link rather than the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_) | BrokerError::Disconnected(_) | BrokerError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Executor Trait
// ---------------------------------------------------------------------------

/// Issues real venue commands on behalf of the synthetic order emulator.
///
/// Implementations must not retry on their own; a failure is recorded on
/// the triggering order and left to the adapter.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: ExecCommand) -> Result<(), BrokerError>;
}
