//! Retained message store
//!
//! Last-value cache keyed by topic name. A retained publish with an empty
//! payload clears the entry for its topic.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// Retained message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Concurrent retained store; last writer wins per topic
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the retained message for its topic
    pub fn set(&self, message: RetainedMessage) {
        self.messages.insert(message.topic.to_string(), message);
    }

    /// Remove the retained message for `topic`
    pub fn remove(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.remove(topic).map(|(_, m)| m)
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|m| m.clone())
    }

    /// All retained messages whose topic matches `filter`
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        // a filter without wildcards names exactly one topic
        if !filter.contains(&['+', '#'][..]) {
            return self.get(filter).into_iter().collect();
        }

        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Load messages restored from storage
    pub fn restore(&self, messages: impl IntoIterator<Item = RetainedMessage>) {
        for message in messages {
            if !message.payload.is_empty() {
                self.set(message);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
