use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::transport::message::Message;
use crate::utils::{BrokerError, DeliveryFailureReason};

pub type ClientId = String;

/// Transport lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Represents a connected client in the Pub/Sub system.
///
/// The connection task owns the `Arc<Client>`; the subscriber registry only
/// keeps `Weak` references. Frames pushed through `deliver` or `send` land in
/// a bounded queue drained by the connection's writer task, so the routing
/// side never writes to a socket directly.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for the client (UUID v4).
    pub id: ClientId,

    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,

    sender: mpsc::Sender<Message>,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Client {
    /// Create a new client around the sending half of its outbound queue.
    /// Cancelling `shutdown` (or calling [`Client::close`]) aborts the
    /// connection.
    pub fn new(sender: mpsc::Sender<Message>, shutdown: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connected_at: Utc::now(),
            sender,
            state: AtomicU8::new(ConnectionState::Open as u8),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Non-blocking delivery used by fan-out. Never waits for queue space:
    /// a subscriber that cannot keep up gets a `QueueFull` failure instead of
    /// stalling the publisher.
    pub fn deliver(&self, message: Message) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(self.delivery_failure(DeliveryFailureReason::NotOpen));
        }
        self.sender.try_send(message).map_err(|err| {
            let reason = match err {
                TrySendError::Full(_) => DeliveryFailureReason::QueueFull,
                TrySendError::Closed(_) => DeliveryFailureReason::QueueClosed,
            };
            self.delivery_failure(reason)
        })
    }

    /// Queue a response on this client's own connection, waiting for space.
    /// Gives up as soon as the connection is cancelled.
    pub async fn send(&self, message: Message) -> Result<(), BrokerError> {
        tokio::select! {
            res = self.sender.send(message) => res.map_err(|_| BrokerError::connection_closed()),
            _ = self.shutdown.cancelled() => Err(BrokerError::connection_closed()),
        }
    }

    /// Move to `Closing` without abandoning frames already queued.
    /// Returns `false` if the connection was not open.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Abort the connection. Safe to call from any task, any number of times.
    pub fn close(&self) {
        self.begin_close();
        self.shutdown.cancel();
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Resolves once the connection has been aborted.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn delivery_failure(&self, reason: DeliveryFailureReason) -> BrokerError {
        BrokerError::DeliveryFailure {
            client_id: self.id.clone(),
            reason,
        }
    }
}
