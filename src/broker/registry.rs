//! Subscriber registry
//!
//! Maps each topic to the connections subscribed to it, plus a reverse index
//! from connection to topics so a closing connection can be removed in one
//! pass. The registry holds `Weak<Client>` only: it can find a connection
//! but never keeps one alive.
//!
//! Concurrency notes:
//! - Both indexes are `DashMap`s; every operation is independently atomic
//!   and callers need no external lock.
//! - No code path holds a guard on one index while touching the other.
//! - `fan_out` copies the subscriber set under the shard read lock and
//!   releases it before delivering, so concurrent subscribe/unsubscribe never
//!   races with iteration.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::client::{Client, ClientId};
use crate::transport::message::Message;
use crate::utils::{BrokerError, DeliveryFailureReason};

/// Result of a single fan-out call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    topics: DashMap<String, HashMap<ClientId, Weak<Client>>>,
    by_client: DashMap<ClientId, HashSet<String>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` to `topic`. Subscribing twice is a no-op. Returns whether
    /// the pairing is new; a connection that is no longer open is not
    /// registered.
    pub fn subscribe(&self, topic: &str, client: &Arc<Client>) -> bool {
        if !client.is_open() {
            return false;
        }
        let added = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(client.id.clone(), Arc::downgrade(client))
            .is_none();
        self.by_client
            .entry(client.id.clone())
            .or_default()
            .insert(topic.to_string());
        added
    }

    /// Remove the `(topic, client_id)` pairing if present.
    pub fn unsubscribe(&self, topic: &str, client_id: &ClientId) -> bool {
        let removed = self.remove_pairing(topic, client_id);
        if let Some(mut topics) = self.by_client.get_mut(client_id) {
            topics.remove(topic);
        }
        self.by_client
            .remove_if(client_id, |_, topics| topics.is_empty());
        removed
    }

    /// Drop every subscription held by `client_id`. Returns how many
    /// pairings were removed.
    pub fn remove_connection(&self, client_id: &ClientId) -> usize {
        let Some((_, topics)) = self.by_client.remove(client_id) else {
            return 0;
        };
        topics
            .iter()
            .filter(|topic| self.remove_pairing(topic, client_id))
            .count()
    }

    /// Push `payload` to every connection subscribed to `topic` right now.
    ///
    /// Delivery never waits on a subscriber. A subscriber whose delivery
    /// fails is closed and unsubscribed; the remaining subscribers are still
    /// served and the caller only sees the counts.
    pub fn fan_out(&self, topic: &str, payload: &Bytes) -> FanOut {
        let targets: Vec<(ClientId, Weak<Client>)> = match self.topics.get(topic) {
            Some(subscribers) => subscribers
                .iter()
                .map(|(id, client)| (id.clone(), client.clone()))
                .collect(),
            None => return FanOut::default(),
        };

        let mut report = FanOut::default();
        for (client_id, client) in targets {
            let Some(client) = client.upgrade() else {
                debug!(client_id = %client_id, topic, "pruning subscriber of a dropped connection");
                self.unsubscribe(topic, &client_id);
                report.failed += 1;
                continue;
            };

            match client.deliver(Message::publish(topic, payload.clone())) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(client_id = %client_id, topic, "{err}");
                    if !matches!(
                        err,
                        BrokerError::DeliveryFailure {
                            reason: DeliveryFailureReason::NotOpen,
                            ..
                        }
                    ) {
                        client.close();
                    }
                    self.unsubscribe(topic, &client_id);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Snapshot of the connections currently subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str, client_id: &ClientId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(client_id))
    }

    /// Topics held by `client_id`.
    pub fn topics_of(&self, client_id: &ClientId) -> Vec<String> {
        self.by_client
            .get(client_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn remove_pairing(&self, topic: &str, client_id: &ClientId) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut subscribers) => subscribers.remove(client_id).is_some(),
            None => false,
        };
        self.topics
            .remove_if(topic, |_, subscribers| subscribers.is_empty());
        removed
    }
}
