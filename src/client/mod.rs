//! The `client` module defines the broker-side representation of a connected
//! client.
//!
//! It provides the `Client` struct, which encapsulates one connection's
//! identifier, lifecycle state and the bounded queue used to push frames to
//! it.

pub mod pubsub_client;
pub use pubsub_client::{Client, ClientId, ConnectionState};
