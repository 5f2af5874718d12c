//! Broker engine
//!
//! `Broker` bundles the two pieces of state shared by every connection: the
//! retained-message store and the subscriber registry. One instance is built
//! when the server starts and handed to each connection handler as
//! `Arc<Broker>`; it lives as long as the server.
//!
//! Concurrency and usage notes:
//! - All synchronization is internal. Callers never wrap the broker in a
//!   lock.
//! - Retaining a publish and fanning it out are two separate steps and are
//!   not atomic as a pair. A reader may observe the new retained payload
//!   before every subscriber has it queued.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::broker::registry::{FanOut, SubscriberRegistry};
use crate::broker::topic::TopicStore;
use crate::client::{Client, ClientId};

#[derive(Debug, Default)]
pub struct Broker {
    topics: TopicStore,
    subscribers: SubscriberRegistry,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: TopicStore::new(),
            subscribers: SubscriberRegistry::new(),
        }
    }

    pub fn topics(&self) -> &TopicStore {
        &self.topics
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    /// Store `payload` as the retained value of `topic`.
    pub fn retain(&self, topic: &str, payload: Bytes) {
        self.topics.put(topic, payload);
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.topics.get(topic)
    }

    /// Deliver `payload` to the current subscribers of `topic`.
    pub fn fan_out(&self, topic: &str, payload: &Bytes) -> FanOut {
        let report = self.subscribers.fan_out(topic, payload);
        debug!(
            topic,
            delivered = report.delivered,
            failed = report.failed,
            "fan-out complete"
        );
        report
    }

    /// Retain then fan out.
    pub fn publish(&self, topic: &str, payload: Bytes) -> FanOut {
        self.retain(topic, payload.clone());
        self.fan_out(topic, &payload)
    }

    /// Subscribes a client to a topic. Automatically creates the topic if it
    /// doesn't exist.
    pub fn subscribe(&self, topic: &str, client: &Arc<Client>) -> bool {
        self.subscribers.subscribe(topic, client)
    }

    pub fn unsubscribe(&self, topic: &str, client_id: &ClientId) -> bool {
        self.subscribers.unsubscribe(topic, client_id)
    }

    /// Unsubscribes a closed client from every topic.
    pub fn cleanup_client(&self, client_id: &ClientId) {
        let removed = self.subscribers.remove_connection(client_id);
        info!(client_id = %client_id, subscriptions = removed, "cleaned up client");
    }
}
