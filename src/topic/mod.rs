//! Topic matching and subscription index
//!
//! Topic name/filter validation plus the `TopicMatcher`, a trie-backed index
//! from subscription filters to subscriber identities (MQTT v3.1.1 section 4.7).
//!
//! The index is not the source of truth for which subscriptions exist; each
//! `Session` owns its subscription set and the post office mirrors every change
//! into the matcher.
//!
//! - Matching uses a callback over the trie to avoid intermediate collections
//! - Results are a SmallVec since most topics have few subscribers

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscriber matched for a topic, one per (filter, client) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Client ID
    pub client_id: Arc<str>,
    /// QoS granted for the filter
    pub qos: QoS,
    /// Filter through which the topic matched
    pub filter: Arc<str>,
}

/// Subscribers of one filter
#[derive(Debug)]
struct FilterEntry {
    filter: Arc<str>,
    subscribers: AHashMap<Arc<str>, QoS>,
}

/// Thread-safe subscription index over a topic trie
///
/// A single coarse lock guards the trie; every critical section is a short
/// in-memory walk.
pub struct TopicMatcher {
    trie: RwLock<TopicTrie<FilterEntry>>,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Index `client_id` under `filter`, replacing the QoS of an existing entry
    pub fn index(&self, filter: &str, client_id: &Arc<str>, qos: QoS) {
        let mut trie = self.trie.write();
        let entry = trie.get_or_insert_with(filter, || FilterEntry {
            filter: Arc::from(filter),
            subscribers: AHashMap::with_capacity(1),
        });
        entry.subscribers.insert(client_id.clone(), qos);
    }

    /// Remove `client_id` from `filter`; returns whether an entry existed
    pub fn remove(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(entry) = trie.get_mut(filter) else {
            return false;
        };
        let removed = entry.subscribers.remove(client_id).is_some();
        if entry.subscribers.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove every filter entry held by `client_id`
    pub fn remove_all_for(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.retain(|entry| {
            entry.subscribers.remove(client_id);
            !entry.subscribers.is_empty()
        });
    }

    /// Find all subscribers of filters matching a publish topic
    ///
    /// A client subscribed through two matching filters appears once per filter.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 16]> {
        let mut result: SmallVec<[Subscriber; 16]> = SmallVec::new();
        let trie = self.trie.read();
        trie.matches(topic, |entry| {
            for (client_id, qos) in &entry.subscribers {
                result.push(Subscriber {
                    client_id: client_id.clone(),
                    qos: *qos,
                    filter: entry.filter.clone(),
                });
            }
        });
        result
    }

    /// Returns true when no subscription is indexed
    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn client(id: &str) -> Arc<str> {
        Arc::from(id)
    }

    fn matched(matcher: &TopicMatcher, topic: &str) -> Vec<(String, String, QoS)> {
        let mut hits: Vec<_> = matcher
            .matches(topic)
            .into_iter()
            .map(|s| (s.client_id.to_string(), s.filter.to_string(), s.qos))
            .collect();
        hits.sort();
        hits
    }

    #[test]
    fn test_index_and_match() {
        let matcher = TopicMatcher::new();
        matcher.index("sport/+/player1", &client("a"), QoS::AtLeastOnce);
        matcher.index("sport/#", &client("b"), QoS::ExactlyOnce);

        assert_eq!(
            matched(&matcher, "sport/tennis/player1"),
            vec![
                ("a".into(), "sport/+/player1".into(), QoS::AtLeastOnce),
                ("b".into(), "sport/#".into(), QoS::ExactlyOnce),
            ]
        );
        assert_eq!(
            matched(&matcher, "sport/tennis/player1/ranking"),
            vec![("b".into(), "sport/#".into(), QoS::ExactlyOnce)]
        );
    }

    #[test]
    fn test_same_client_two_filters() {
        let matcher = TopicMatcher::new();
        let a = client("a");
        matcher.index("x/+", &a, QoS::AtMostOnce);
        matcher.index("x/#", &a, QoS::ExactlyOnce);

        let hits = matched(&matcher, "x/y");
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(id, _, _)| id == "a"));
    }

    #[test]
    fn test_reindex_replaces_qos() {
        let matcher = TopicMatcher::new();
        let a = client("a");
        matcher.index("t", &a, QoS::AtMostOnce);
        matcher.index("t", &a, QoS::ExactlyOnce);
        assert_eq!(
            matched(&matcher, "t"),
            vec![("a".into(), "t".into(), QoS::ExactlyOnce)]
        );
    }

    #[test]
    fn test_system_topic_not_matched_by_root_wildcards() {
        let matcher = TopicMatcher::new();
        matcher.index("#", &client("a"), QoS::AtMostOnce);
        matcher.index("+/load", &client("b"), QoS::AtMostOnce);
        matcher.index("$SYS/#", &client("c"), QoS::AtMostOnce);

        assert_eq!(
            matched(&matcher, "$SYS/load"),
            vec![("c".into(), "$SYS/#".into(), QoS::AtMostOnce)]
        );
    }

    #[test]
    fn test_remove() {
        let matcher = TopicMatcher::new();
        let a = client("a");
        let b = client("b");
        matcher.index("t/#", &a, QoS::AtLeastOnce);
        matcher.index("t/#", &b, QoS::AtLeastOnce);

        assert!(matcher.remove("t/#", "a"));
        assert!(!matcher.remove("t/#", "a"));
        assert!(!matcher.remove("never/subscribed", "a"));
        assert_eq!(
            matched(&matcher, "t/x"),
            vec![("b".into(), "t/#".into(), QoS::AtLeastOnce)]
        );

        assert!(matcher.remove("t/#", "b"));
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_remove_all_for() {
        let matcher = TopicMatcher::new();
        let a = client("a");
        let b = client("b");
        matcher.index("a/b", &a, QoS::AtMostOnce);
        matcher.index("+/b", &a, QoS::AtMostOnce);
        matcher.index("#", &a, QoS::AtMostOnce);
        matcher.index("a/b", &b, QoS::AtLeastOnce);

        matcher.remove_all_for("a");
        assert_eq!(
            matched(&matcher, "a/b"),
            vec![("b".into(), "a/b".into(), QoS::AtLeastOnce)]
        );

        matcher.remove_all_for("b");
        assert!(matcher.is_empty());
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just("c".to_string()),
            Just(String::new()),
            Just("$SYS".to_string()),
        ]
    }

    fn filter_level() -> impl Strategy<Value = String> {
        prop_oneof![level(), Just("+".to_string())]
    }

    fn topic_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(level(), 1..5).prop_map(|levels| levels.join("/"))
    }

    fn filter_strategy() -> impl Strategy<Value = String> {
        (prop::collection::vec(filter_level(), 1..5), any::<bool>()).prop_map(|(levels, hash)| {
            let mut filter = levels.join("/");
            if hash {
                filter.push_str("/#");
            }
            filter
        })
    }

    proptest! {
        #[test]
        fn matcher_agrees_with_filter_predicate(
            filters in prop::collection::vec(filter_strategy(), 1..8),
            topic in topic_strategy(),
        ) {
            let matcher = TopicMatcher::new();
            let id = client("c");
            for filter in &filters {
                matcher.index(filter, &id, QoS::AtMostOnce);
            }

            let mut expected: Vec<String> = filters
                .iter()
                .filter(|f| topic_matches_filter(&topic, f))
                .cloned()
                .collect();
            expected.sort();
            expected.dedup();

            let mut actual: Vec<String> = matcher
                .matches(&topic)
                .into_iter()
                .map(|s| s.filter.to_string())
                .collect();
            actual.sort();

            prop_assert_eq!(actual, expected);
        }
    }
}
