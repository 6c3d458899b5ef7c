//! Realtime transport: STOMP over WebSocket with automatic reconnect and
//! topic re-subscription.

pub mod backoff;
pub mod channel;
pub mod connector;
pub mod error;
pub mod memory;
pub mod stomp;

pub use backoff::Backoff;
pub use channel::{Channel, ConnectionState, Delivery, GatewayConfig, Handler, SubscriptionToken};
pub use connector::{Connector, Link, WsConnector};
pub use error::TransportError;
pub use memory::{MemoryBroker, MemoryConnector};
