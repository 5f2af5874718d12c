//! Length-prefixed framing for the broker protocol.
//!
//! Every frame is `[kind: u8][body_len: u32 BE][body]`. Strings inside a
//! body are `[len: u16 BE][UTF-8 bytes]`. The codec keeps no state between
//! calls apart from its limits; `Framed` owns the partial-frame buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::BrokerSettings;
use crate::transport::message::{Message, MessageKind};
use crate::utils::{BrokerError, MalformedFrame};

/// Kind byte plus the 4 byte body length.
pub const HEADER_LEN: usize = 5;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

pub const DEFAULT_MAX_TOPIC_LEN: usize = 1024;

const STRING_PREFIX_LEN: usize = 2;

#[derive(Debug, Clone)]
pub struct BrokeCodec {
    max_frame_size: usize,
    max_topic_len: usize,
}

impl BrokeCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_topic_len: DEFAULT_MAX_TOPIC_LEN,
        }
    }

    /// Largest body a peer may declare before the frame is rejected.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Largest string field (topic or client label) accepted while decoding.
    #[must_use]
    pub const fn with_max_topic_len(mut self, len: usize) -> Self {
        self.max_topic_len = len;
        self
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new()
            .with_max_frame_size(settings.max_frame_size)
            .with_max_topic_len(settings.max_topic_len)
    }

    fn decode_body(&self, kind: MessageKind, mut body: Bytes) -> Result<Message, MalformedFrame> {
        let message = match kind {
            MessageKind::Connect => Message::Connect {
                client_id: self.read_string(&mut body)?,
            },
            MessageKind::Publish => {
                let topic = self.read_topic(&mut body)?;
                // Payload is whatever follows the topic.
                return Ok(Message::Publish {
                    topic,
                    payload: body,
                });
            }
            MessageKind::Subscribe => Message::Subscribe {
                topic: self.read_topic(&mut body)?,
            },
            MessageKind::Unsubscribe => Message::Unsubscribe {
                topic: self.read_topic(&mut body)?,
            },
            MessageKind::Ack => {
                if !body.has_remaining() {
                    return Err(MalformedFrame::Truncated);
                }
                let kind = MessageKind::try_from(body.get_u8())?;
                Message::Ack {
                    kind,
                    topic: self.read_string(&mut body)?,
                }
            }
            MessageKind::Disconnect => Message::Disconnect,
        };

        if body.has_remaining() {
            return Err(MalformedFrame::TrailingBytes(body.remaining()));
        }
        Ok(message)
    }

    fn read_string(&self, body: &mut Bytes) -> Result<String, MalformedFrame> {
        if body.remaining() < STRING_PREFIX_LEN {
            return Err(MalformedFrame::Truncated);
        }
        let len = usize::from(body.get_u16());
        if len > self.max_topic_len {
            return Err(MalformedFrame::TopicTooLong {
                len,
                max: self.max_topic_len,
            });
        }
        if body.remaining() < len {
            return Err(MalformedFrame::Truncated);
        }
        let raw = body.split_to(len);
        std::str::from_utf8(&raw)
            .map(str::to_owned)
            .map_err(|_| MalformedFrame::InvalidUtf8)
    }

    fn read_topic(&self, body: &mut Bytes) -> Result<String, MalformedFrame> {
        let topic = self.read_string(body)?;
        if topic.is_empty() {
            return Err(MalformedFrame::EmptyTopic);
        }
        Ok(topic)
    }
}

impl Default for BrokeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BrokeCodec {
    type Item = Message;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&kind_byte) = src.first() else {
            return Ok(None);
        };
        // Reject garbage as soon as the first byte arrives.
        let kind = MessageKind::try_from(kind_byte)?;

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if body_len > self.max_frame_size {
            return Err(MalformedFrame::BodyTooLarge {
                size: body_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        Ok(Some(self.decode_body(kind, body)?))
    }
}

impl Encoder<Message> for BrokeCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = body_len(&item)?;
        let wire_len = u32::try_from(body_len).map_err(|_| MalformedFrame::BodyTooLarge {
            size: body_len,
            max: u32::MAX as usize,
        })?;

        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(item.kind().into());
        dst.put_u32(wire_len);

        match item {
            Message::Connect { client_id } => put_string(dst, &client_id),
            Message::Publish { topic, payload } => {
                put_string(dst, &topic);
                dst.put_slice(&payload);
            }
            Message::Subscribe { topic } | Message::Unsubscribe { topic } => {
                put_string(dst, &topic)
            }
            Message::Ack { kind, topic } => {
                dst.put_u8(kind.into());
                put_string(dst, &topic);
            }
            Message::Disconnect => {}
        }
        Ok(())
    }
}

fn string_len(s: &str) -> Result<usize, MalformedFrame> {
    if s.len() > usize::from(u16::MAX) {
        return Err(MalformedFrame::TopicTooLong {
            len: s.len(),
            max: usize::from(u16::MAX),
        });
    }
    Ok(STRING_PREFIX_LEN + s.len())
}

fn body_len(message: &Message) -> Result<usize, MalformedFrame> {
    Ok(match message {
        Message::Connect { client_id } => string_len(client_id)?,
        Message::Publish { topic, payload } => string_len(topic)? + payload.len(),
        Message::Subscribe { topic } | Message::Unsubscribe { topic } => string_len(topic)?,
        Message::Ack { topic, .. } => 1 + string_len(topic)?,
        Message::Disconnect => 0,
    })
}

// Callers have already checked the length with `string_len`.
fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}
