//! Client-side synchronization layer for a jamroom server.
//!
//! Keeps local application state (playback transport, devices, timeline
//! clips, chat history) mirrored from a single authoritative server:
//! a WebSocket push channel with reconnection feeds a domain-partitioned
//! reactive store, and a command layer issues HTTP operations with
//! deadline, retry, debounce, and optimistic-update semantics.
//!
//! UI rendering and identity/key handling live outside this crate;
//! consumers read the [`Store`], call [`Commands`] actions, and provide a
//! bearer credential via [`ClientConfig`].

pub mod api_client;
pub mod client;
pub mod commands;
pub mod config;
pub mod optimistic;
pub mod scope;
pub mod store;
pub mod ws;

pub use api_client::ApiClient;
pub use client::Client;
pub use commands::{CommandError, CommandPolicy, Commands};
pub use config::ClientConfig;
pub use scope::Scope;
pub use store::{AppState, StatePatch, Store};
pub use ws::connection::{Connection, ConnectionStatus, ReconnectConfig, StatusEvent};
pub use ws::registry::{Subscription, Topic};
