//! The `transport` module is responsible for network communication with
//! clients over TCP.
//!
//! It defines the binary framing and message types used between clients and
//! the server, the per-connection protocol handler, and the listener that
//! accepts connections and hands each one to a handler.

pub mod codec;
pub mod connection;
pub mod message;
pub mod server;

pub use codec::BrokeCodec;
pub use connection::{CloseReason, ConnectionHandler, Outcome, ProtocolState, handle_connection};
pub use message::{Message, MessageKind};
pub use server::{serve, start_server};

#[cfg(test)]
mod connection_tests;
