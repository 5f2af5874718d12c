//! Connection handler
//!
//! One handler runs per accepted connection. Responsibilities:
//! - Decode inbound frames in order and drive the protocol state machine
//!   (`AwaitingConnect -> Connected -> Closed`)
//! - Apply routing side effects on the shared `Broker`
//! - Queue responses on the connection's own outbound queue; a dedicated
//!   writer task drains that queue to the socket
//! - Unregister the connection exactly once, on every exit path
//!
//! A protocol violation or transport failure only ever closes this
//! connection.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::client::Client;
use crate::config::BrokerSettings;
use crate::transport::codec::BrokeCodec;
use crate::transport::message::{Message, MessageKind};
use crate::utils::{BrokerError, Result};

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    AwaitingConnect,
    Connected,
    Closed,
}

/// Result of dispatching one decoded message.
#[derive(Debug)]
pub enum Outcome {
    Handled,
    Disconnect,
    Error(BrokerError),
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Client sent DISCONNECT.
    Disconnect,
    /// Client closed its side of the transport.
    PeerClosed,
    /// Aborted from another task (server shutdown, slow consumer, write
    /// failure).
    Cancelled,
    Error(BrokerError),
}

/// Unregisters the connection when dropped, whichever way the handler exits.
struct Registration {
    broker: Arc<Broker>,
    client: Arc<Client>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.client.begin_close();
        self.broker.cleanup_client(&self.client.id);
        self.client.mark_closed();
        info!(
            client_id = %self.client.id,
            connected_ms = (Utc::now() - self.client.connected_at).num_milliseconds(),
            "client disconnected"
        );
    }
}

pub struct ConnectionHandler {
    registration: Registration,
    settings: Arc<BrokerSettings>,
    state: ProtocolState,
}

impl ConnectionHandler {
    pub fn new(broker: Arc<Broker>, settings: Arc<BrokerSettings>, client: Arc<Client>) -> Self {
        Self {
            registration: Registration { broker, client },
            settings,
            state: ProtocolState::AwaitingConnect,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.registration.client
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    fn broker(&self) -> &Broker {
        &self.registration.broker
    }

    /// Process frames until the peer leaves, a frame is rejected, or the
    /// connection is cancelled.
    pub async fn run<St>(&mut self, frames: &mut St) -> CloseReason
    where
        St: Stream<Item = Result<Message>> + Unpin,
    {
        let reason = self.read_loop(frames).await;
        self.state = ProtocolState::Closed;
        reason
    }

    async fn read_loop<St>(&mut self, frames: &mut St) -> CloseReason
    where
        St: Stream<Item = Result<Message>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.client().cancelled() => return CloseReason::Cancelled,
                next = frames.next() => next,
            };

            let message = match next {
                None => return CloseReason::PeerClosed,
                Some(Ok(message)) => message,
                Some(Err(err)) => return self.abort(err),
            };

            match self.dispatch(message).await {
                Outcome::Handled => {}
                Outcome::Disconnect => return CloseReason::Disconnect,
                Outcome::Error(err) => return self.abort(err),
            }
        }
    }

    fn abort(&self, err: BrokerError) -> CloseReason {
        if err.is_protocol_violation() {
            warn!(client_id = %self.client().id, "protocol error: {err}");
        } else {
            debug!(client_id = %self.client().id, "transport error: {err}");
        }
        self.client().close();
        CloseReason::Error(err)
    }

    /// Apply one decoded message.
    pub async fn dispatch(&mut self, message: Message) -> Outcome {
        if let Err(err) = self.advance(message.kind()) {
            return Outcome::Error(err);
        }

        let result = match message {
            Message::Connect { client_id } => self.on_connect(client_id).await,
            Message::Publish { topic, payload } => self.on_publish(topic, payload).await,
            Message::Subscribe { topic } => self.on_subscribe(topic).await,
            Message::Unsubscribe { topic } => self.on_unsubscribe(topic).await,
            Message::Disconnect => return Outcome::Disconnect,
            Message::Ack { kind, .. } => {
                debug!(client_id = %self.client().id, ?kind, "unexpected ACK from client");
                Err(BrokerError::UnsupportedMessageKind(MessageKind::Ack))
            }
        };

        match result {
            Ok(()) => Outcome::Handled,
            Err(err) => Outcome::Error(err),
        }
    }

    // CONNECT is optional unless `require_connect` is set; any other first
    // frame moves the connection to `Connected` implicitly.
    fn advance(&mut self, kind: MessageKind) -> Result<()> {
        match (self.state, kind) {
            (ProtocolState::Closed, _) | (ProtocolState::Connected, MessageKind::Connect) => {
                Err(BrokerError::UnsupportedMessageKind(kind))
            }
            (ProtocolState::Connected, _) | (ProtocolState::AwaitingConnect, MessageKind::Disconnect) => {
                Ok(())
            }
            (ProtocolState::AwaitingConnect, MessageKind::Connect) => {
                self.state = ProtocolState::Connected;
                Ok(())
            }
            (ProtocolState::AwaitingConnect, _) if self.settings.require_connect => {
                Err(BrokerError::UnsupportedMessageKind(kind))
            }
            (ProtocolState::AwaitingConnect, _) => {
                self.state = ProtocolState::Connected;
                Ok(())
            }
        }
    }

    async fn on_connect(&self, label: String) -> Result<()> {
        info!(client_id = %self.client().id, label = %label, "client connected with handshake");
        self.reply(Message::ack(MessageKind::Connect, "")).await
    }

    async fn on_publish(&self, topic: String, payload: Bytes) -> Result<()> {
        // Retain first: the ACK promises the payload is stored.
        self.broker().retain(&topic, payload.clone());
        self.reply(Message::ack(MessageKind::Publish, topic.as_str()))
            .await?;
        let report = self.broker().fan_out(&topic, &payload);
        debug!(
            client_id = %self.client().id,
            topic = %topic,
            bytes = payload.len(),
            delivered = report.delivered,
            "published"
        );
        Ok(())
    }

    async fn on_subscribe(&self, topic: String) -> Result<()> {
        self.broker().subscribe(&topic, self.client());
        self.reply(Message::ack(MessageKind::Subscribe, topic.as_str()))
            .await?;
        debug!(client_id = %self.client().id, topic = %topic, "subscribed");

        if self.settings.retain_on_subscribe {
            if let Some(payload) = self.broker().retained(&topic) {
                self.reply(Message::Publish { topic, payload }).await?;
            }
        }
        Ok(())
    }

    async fn on_unsubscribe(&self, topic: String) -> Result<()> {
        self.broker().unsubscribe(&topic, &self.client().id);
        debug!(client_id = %self.client().id, topic = %topic, "unsubscribed");
        self.reply(Message::ack(MessageKind::Unsubscribe, topic))
            .await
    }

    async fn reply(&self, message: Message) -> Result<()> {
        self.client().send(message).await
    }
}

/// Drive one connection to completion.
///
/// `shutdown` is the server-wide token; the connection gets a child of it so
/// cancelling the server closes every connection. After the read side ends,
/// queued frames get `broker.drain_timeout_ms` to reach the peer.
pub async fn handle_connection<S>(
    stream: S,
    broker: Arc<Broker>,
    settings: Arc<BrokerSettings>,
    shutdown: CancellationToken,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = BrokeCodec::from_settings(&settings);
    let (sink, mut frames) = Framed::new(stream, codec).split::<Message>();

    let (tx, rx) = mpsc::channel(settings.outbound_queue_capacity.max(1));
    let token = shutdown.child_token();
    let client = Arc::new(Client::new(tx, token.clone()));
    info!(client_id = %client.id, "client connected");

    let mut writer = tokio::spawn(write_loop(sink, rx, token.clone()));
    let drain_timeout = settings.drain_timeout();

    let mut handler = ConnectionHandler::new(broker, settings, client);
    let reason = handler.run(&mut frames).await;

    // Unregisters and releases the queue's sender, which lets the writer
    // drain what is left and finish.
    drop(handler);
    let joined = match time::timeout(drain_timeout, &mut writer).await {
        Ok(joined) => joined,
        Err(_) => {
            debug!("outbound drain timed out after {drain_timeout:?}, abandoning queued frames");
            token.cancel();
            writer.await
        }
    };
    if let Err(err) = joined {
        warn!("writer task failed: {err}");
    }
    reason
}

/// Drains the outbound queue into the socket until every sender is gone or
/// the connection is cancelled. Cancellation abandons queued frames.
async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Message>, shutdown: CancellationToken)
where
    S: Sink<Message, Error = BrokerError> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            written = write_batch(&mut sink, &mut rx, message) => written,
        };

        if let Err(err) = written {
            debug!("write failed: {err}");
            shutdown.cancel();
            return;
        }
    }

    if let Err(err) = sink.close().await {
        debug!("close failed: {err}");
    }
}

// Feed everything already queued, then flush once.
async fn write_batch<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<Message>,
    first: Message,
) -> Result<()>
where
    S: Sink<Message, Error = BrokerError> + Unpin,
{
    sink.feed(first).await?;
    while let Ok(message) = rx.try_recv() {
        sink.feed(message).await?;
    }
    sink.flush().await
}
