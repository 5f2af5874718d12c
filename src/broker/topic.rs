//! Retained-message storage
//!
//! `TopicStore` keeps the most recently published payload of every topic.
//! Each `put` replaces the previous value wholesale, so readers see either a
//! complete payload or nothing. The store never notifies anyone; fan-out is a
//! separate step driven by the connection handler.

use bytes::Bytes;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct TopicStore {
    retained: DashMap<String, Bytes>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the retained payload for `topic`, creating the topic if
    /// needed.
    pub fn put(&self, topic: &str, payload: Bytes) {
        self.retained.insert(topic.to_owned(), payload);
    }

    pub fn get(&self, topic: &str) -> Option<Bytes> {
        self.retained.get(topic).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.retained.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}
