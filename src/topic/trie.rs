//! Topic Trie for subscription matching and retained messages
//!
//! A prefix tree keyed by `/`-separated topic levels. Each node holds:
//! - literal children, a `+` child, and the subscribers of `<path>/#`
//! - the subscribers whose filter ends exactly at the node
//! - at most one retained message for the literal topic leading to the node
//!
//! Retained messages are only ever written by walking literal children from
//! the root, so they never live below a `+` node.

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol::QoS;

use super::RetainedMessage;

/// Node in the topic trie
#[derive(Debug, Default)]
struct TrieNode {
    /// Children indexed by literal topic level
    children: AHashMap<CompactString, TrieNode>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode>>,
    /// Filters terminating at this node
    subscribers: AHashMap<Arc<str>, QoS>,
    /// Filters of the form `<path to this node>/#`
    multi_wildcard: AHashMap<Arc<str>, QoS>,
    /// Last retained message published to exactly this topic
    retained: Option<RetainedMessage>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.single_wildcard.is_none()
            && self.subscribers.is_empty()
            && self.multi_wildcard.is_empty()
            && self.retained.is_none()
    }
}

/// Topic Trie
#[derive(Debug, Default)]
pub struct TopicTrie {
    root: TrieNode,
}

impl TopicTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `client_id` at the node for `filter`.
    ///
    /// Replaces the QoS of an existing subscription by the same client.
    /// Returns true if the subscription is new. The filter must already be
    /// validated.
    pub fn subscribe(&mut self, filter: &str, client_id: Arc<str>, qos: QoS) -> bool {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.insert(client_id, qos).is_none();
            }

            node = if level == "+" {
                &mut **node.single_wildcard.get_or_insert_with(Box::default)
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                return node.subscribers.insert(client_id, qos).is_none();
            }
        }

        false
    }

    /// Remove `client_id` from the node for `filter`
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::unsubscribe_recursive(&mut self.root, &levels, client_id)
    }

    fn unsubscribe_recursive(node: &mut TrieNode, levels: &[&str], client_id: &str) -> bool {
        let Some((level, rest)) = levels.split_first() else {
            return node.subscribers.remove(client_id).is_some();
        };

        match *level {
            "#" => node.multi_wildcard.remove(client_id).is_some(),
            "+" => match node.single_wildcard {
                Some(ref mut child) => {
                    let removed = Self::unsubscribe_recursive(child, rest, client_id);
                    if child.is_empty() {
                        node.single_wildcard = None;
                    }
                    removed
                }
                None => false,
            },
            literal => match node.children.get_mut(literal) {
                Some(child) => {
                    let removed = Self::unsubscribe_recursive(child, rest, client_id);
                    if child.is_empty() {
                        node.children.remove(literal);
                    }
                    removed
                }
                None => false,
            },
        }
    }

    /// Remove every subscription held by `client_id`
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        Self::remove_client_recursive(&mut self.root, client_id)
    }

    fn remove_client_recursive(node: &mut TrieNode, client_id: &str) -> usize {
        let mut removed = node.subscribers.remove(client_id).is_some() as usize;
        removed += node.multi_wildcard.remove(client_id).is_some() as usize;

        if let Some(ref mut child) = node.single_wildcard {
            removed += Self::remove_client_recursive(child, client_id);
        }
        for child in node.children.values_mut() {
            removed += Self::remove_client_recursive(child, client_id);
        }
        removed
    }

    /// Visit every subscription matching a topic name
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Arc<str>, QoS),
    {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&Arc<str>, QoS),
    {
        let at_root = index == 0;

        // `#` here also covers the parent level, so it is checked before the
        // end-of-topic test
        if !(is_system_topic && at_root) {
            for (client_id, qos) in &node.multi_wildcard {
                callback(client_id, *qos);
            }
        }

        if index >= levels.len() {
            for (client_id, qos) in &node.subscribers {
                callback(client_id, *qos);
            }
            return;
        }

        if !(is_system_topic && at_root) {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Store or clear the retained message for a literal topic.
    ///
    /// An empty payload clears retention.
    pub fn set_retained(&mut self, message: RetainedMessage) {
        if message.payload.is_empty() {
            let levels: SmallVec<[&str; 8]> = message.topic.split('/').collect();
            Self::clear_retained_recursive(&mut self.root, &levels);
            return;
        }

        let mut node = &mut self.root;
        for level in message.topic.split('/') {
            node = node.children.entry(CompactString::new(level)).or_default();
        }
        node.retained = Some(message);
    }

    fn clear_retained_recursive(node: &mut TrieNode, levels: &[&str]) {
        let Some((level, rest)) = levels.split_first() else {
            node.retained = None;
            return;
        };
        if let Some(child) = node.children.get_mut(*level) {
            Self::clear_retained_recursive(child, rest);
            if child.is_empty() {
                node.children.remove(*level);
            }
        }
    }

    /// Visit every retained message whose topic matches `filter`
    pub fn retained_matching<F>(&self, filter: &str, mut callback: F)
    where
        F: FnMut(&RetainedMessage),
    {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::retained_recursive(&self.root, &levels, 0, &mut callback);
    }

    fn retained_recursive<F>(node: &TrieNode, levels: &[&str], index: usize, callback: &mut F)
    where
        F: FnMut(&RetainedMessage),
    {
        if index >= levels.len() {
            if let Some(ref retained) = node.retained {
                callback(retained);
            }
            return;
        }

        let at_root = index == 0;
        match levels[index] {
            "#" => {
                if let Some(ref retained) = node.retained {
                    callback(retained);
                }
                Self::retained_descendants(node, at_root, callback);
            }
            "+" => {
                for (level, child) in &node.children {
                    if at_root && level.starts_with('$') {
                        continue;
                    }
                    Self::retained_recursive(child, levels, index + 1, callback);
                }
            }
            literal => {
                if let Some(child) = node.children.get(literal) {
                    Self::retained_recursive(child, levels, index + 1, callback);
                }
            }
        }
    }

    fn retained_descendants<F>(node: &TrieNode, skip_system: bool, callback: &mut F)
    where
        F: FnMut(&RetainedMessage),
    {
        for (level, child) in &node.children {
            if skip_system && level.starts_with('$') {
                continue;
            }
            if let Some(ref retained) = child.retained {
                callback(retained);
            }
            Self::retained_descendants(child, false, callback);
        }
    }

    /// Number of retained messages held
    pub fn retained_count(&self) -> usize {
        fn count(node: &TrieNode) -> usize {
            node.retained.is_some() as usize + node.children.values().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}
