//! Shared utilities used across `broke`: the crate-wide error type and
//! logging initialization.

pub mod error;
pub mod logging;

pub use error::{BrokerError, DeliveryFailureReason, MalformedFrame, Result};
