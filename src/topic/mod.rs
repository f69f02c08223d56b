//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and the shared subscription
//! index. The index is a single trie behind a `parking_lot::RwLock`:
//! subscribe, unsubscribe and retained writes take the write lock, routing
//! lookups share the read lock.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    effective_max_levels, topic_matches_filter, validate_topic_filter,
    validate_topic_filter_with_max_levels, validate_topic_name,
    validate_topic_name_with_max_levels, MAX_TOPIC_LEVELS,
};

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{Publish, QoS};

/// Errors surfaced by the matcher to the calling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Filter is syntactically invalid (e.g. `#` not last)
    InvalidFilter(&'static str),
    /// Topic name is invalid for publishing
    InvalidTopic(&'static str),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            TopicError::InvalidTopic(msg) => write!(f, "invalid topic name: {}", msg),
        }
    }
}

impl std::error::Error for TopicError {}

/// A retained message stored at its literal topic node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    /// QoS the message was published with
    pub qos: QoS,
}

impl RetainedMessage {
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
        }
    }

    /// PUBLISH for a new subscriber, downgraded to `max_qos`
    pub fn to_publish(&self, max_qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos: self.qos.min(max_qos),
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

/// A routing target: one client and the QoS it should receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// `min(subscription QoS, publish QoS)`
    pub qos: QoS,
}

/// Thread-safe subscription index with retained-message storage
#[derive(Debug, Default)]
pub struct TopicMatcher {
    trie: RwLock<TopicTrie>,
    /// Deepest filter or topic accepted (0 = [`MAX_TOPIC_LEVELS`])
    max_levels: usize,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            trie: RwLock::default(),
            max_levels,
        }
    }

    /// Register `client_id` for `filter` at `qos`.
    ///
    /// Returns the retained messages the new subscription matches, so the
    /// caller can deliver them once, capped at `min(qos, published qos)`.
    pub fn subscribe(
        &self,
        client_id: &Arc<str>,
        filter: &str,
        qos: QoS,
    ) -> Result<Vec<RetainedMessage>, TopicError> {
        validate_topic_filter_with_max_levels(filter, self.max_levels)?;

        let mut trie = self.trie.write();
        trie.subscribe(filter, client_id.clone(), qos);

        let mut retained = Vec::new();
        trie.retained_matching(filter, |msg| retained.push(msg.clone()));
        Ok(retained)
    }

    /// Remove the subscription of `client_id` to `filter`
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        self.trie.write().unsubscribe(filter, client_id)
    }

    /// Remove every subscription held by `client_id`
    pub fn unsubscribe_all(&self, client_id: &str) -> usize {
        self.trie.write().remove_client(client_id)
    }

    /// Route a publish through the index.
    ///
    /// Stores or clears the retained message when `retain` is set, then
    /// returns each matching client once, at the highest QoS any of its
    /// matching subscriptions grants, downgraded to the publish QoS.
    pub fn publish(&self, publish: &Publish) -> SmallVec<[Subscriber; 16]> {
        // Topics too deep for the trie can have no subscribers
        if publish.topic.split('/').count() > effective_max_levels(self.max_levels) {
            return SmallVec::new();
        }
        if publish.retain {
            let mut trie = self.trie.write();
            trie.set_retained(RetainedMessage::from_publish(publish));
            collect_subscribers(&trie, &publish.topic, publish.qos)
        } else {
            let trie = self.trie.read();
            collect_subscribers(&trie, &publish.topic, publish.qos)
        }
    }

    /// Subscribers matching `topic` without touching retained state
    pub fn matches(&self, topic: &str, qos: QoS) -> SmallVec<[Subscriber; 16]> {
        if topic.split('/').count() > effective_max_levels(self.max_levels) {
            return SmallVec::new();
        }
        collect_subscribers(&self.trie.read(), topic, qos)
    }

    /// Retained messages matching a filter
    pub fn retained_for(&self, filter: &str) -> Vec<RetainedMessage> {
        let mut out = Vec::new();
        self.trie
            .read()
            .retained_matching(filter, |msg| out.push(msg.clone()));
        out
    }

    pub fn retained_count(&self) -> usize {
        self.trie.read().retained_count()
    }
}

fn collect_subscribers(trie: &TopicTrie, topic: &str, qos: QoS) -> SmallVec<[Subscriber; 16]> {
    // Overlapping filters collapse to one delivery per client
    let mut best: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(16);
    trie.matches(topic, |client_id, sub_qos| {
        best.entry(client_id.clone())
            .and_modify(|q| *q = (*q).max(sub_qos))
            .or_insert(sub_qos);
    });

    best.into_iter()
        .map(|(client_id, sub_qos)| Subscriber {
            client_id,
            qos: sub_qos.min(qos),
        })
        .collect()
}

#[cfg(test)]
mod tests;
