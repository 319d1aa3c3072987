//! Shared streaming infrastructure for venue adapters: one reconnecting
//! connection, correlated RPC on top of it, and multiplexed quote streams.

pub mod limiter;
pub mod loopback;
pub mod quotes;
pub mod rpc;
pub mod subscribers;
pub mod transport;

pub use limiter::CommandLimiter;
pub use loopback::{loopback, LoopbackConnector, LoopbackListener, LoopbackPeer};
pub use quotes::{HubConfig, QuoteHub, QuoteSubscription};
pub use rpc::{Credentials, RpcClient, SessionEvent, SessionPhase};
pub use subscribers::Subscribers;
pub use transport::{
    Connection, Connector, Frame, StreamTransport, TransportConfig, TransportEvent, WsConnector,
};
