//! Push-channel connection management and typed event dispatch.

pub mod connection;
pub mod registry;

pub use connection::{Connection, ConnectionStatus, ReconnectConfig, StatusEvent};
pub use registry::{Registry, Subscription, Topic};
