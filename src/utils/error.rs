//! The `error` module defines the error types used within `broke`.
//!
//! `BrokerError` is the single error type returned by the codec, the
//! connection handler and the listener. Only the connection that produced an
//! error is ever closed because of it; nothing here is fatal to the process.

use std::io;

use thiserror::Error;

use crate::client::ClientId;
use crate::transport::message::MessageKind;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] MalformedFrame),

    #[error("unsupported message kind {0:?} in current state")]
    UnsupportedMessageKind(MessageKind),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("delivery to {client_id} failed: {reason}")]
    DeliveryFailure {
        client_id: ClientId,
        reason: DeliveryFailureReason,
    },
}

impl BrokerError {
    /// Protocol violations close the offending connection without a
    /// diagnostic; transport errors mean the peer is already gone.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            BrokerError::MalformedFrame(_) | BrokerError::UnsupportedMessageKind(_)
        )
    }

    pub(crate) fn connection_closed() -> Self {
        BrokerError::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "outbound queue closed",
        ))
    }
}

/// Structural violations detected while decoding or encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFrame {
    #[error("unknown message kind byte {0:#04x}")]
    UnknownKind(u8),

    #[error("body of {size} bytes exceeds the {max} byte limit")]
    BodyTooLarge { size: usize, max: usize },

    #[error("topic of {len} bytes exceeds the {max} byte limit")]
    TopicTooLong { len: usize, max: usize },

    #[error("empty topic")]
    EmptyTopic,

    #[error("string field runs past the end of the body")]
    Truncated,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} unexpected trailing bytes in body")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailureReason {
    #[error("connection is no longer open")]
    NotOpen,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("outbound queue is closed")]
    QueueClosed,
}
