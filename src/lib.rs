//! # broke
//!
//! `broke` is a minimal, in-memory publish/subscribe broker speaking a
//! binary, length-prefixed protocol over TCP. Clients publish payloads under
//! string topics; subscribers receive every later publish on the topics they
//! follow, plus the retained (latest) payload when they subscribe.
//!
//! ## Core Modules
//!
//! - `broker`: retained-message store, subscriber registry and fan-out.
//! - `client`: the broker-side handle of one connection.
//! - `config`: loads server configuration from file and environment.
//! - `transport`: wire codec, per-connection handler and TCP listener.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use transport::{BrokeCodec, Message, MessageKind};
pub use utils::{BrokerError, Result};
