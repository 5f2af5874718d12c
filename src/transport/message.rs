//! Protocol messages exchanged between clients and the broker.
//!
//! The same `Message` type is used in both directions: a `Publish` sent by a
//! client is a publish request, a `Publish` sent by the broker is a delivery
//! to a subscriber.

use bytes::Bytes;

use crate::utils::MalformedFrame;

/// The kind byte at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 0x01,
    Publish = 0x03,
    Ack = 0x04,
    Subscribe = 0x08,
    Unsubscribe = 0x0A,
    Disconnect = 0x0E,
}

impl TryFrom<u8> for MessageKind {
    type Error = MalformedFrame;

    fn try_from(value: u8) -> Result<Self, MalformedFrame> {
        match value {
            0x01 => Ok(Self::Connect),
            0x03 => Ok(Self::Publish),
            0x04 => Ok(Self::Ack),
            0x08 => Ok(Self::Subscribe),
            0x0A => Ok(Self::Unsubscribe),
            0x0E => Ok(Self::Disconnect),
            other => Err(MalformedFrame::UnknownKind(other)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Optional handshake. `client_id` is a free-form label used in logs.
    Connect { client_id: String },
    Publish { topic: String, payload: Bytes },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Acknowledges the request of `kind` on `topic`. The topic is empty when
    /// acknowledging a `Connect`.
    Ack { kind: MessageKind, topic: String },
    Disconnect,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connect { .. } => MessageKind::Connect,
            Message::Publish { .. } => MessageKind::Publish,
            Message::Subscribe { .. } => MessageKind::Subscribe,
            Message::Unsubscribe { .. } => MessageKind::Unsubscribe,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Disconnect => MessageKind::Disconnect,
        }
    }

    pub fn publish(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message::Publish {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn ack(kind: MessageKind, topic: impl Into<String>) -> Self {
        Message::Ack {
            kind,
            topic: topic.into(),
        }
    }
}
