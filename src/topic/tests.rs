//! Topic matcher tests

use std::sync::Arc;

use pretty_assertions::assert_eq;
use test_case::test_case;

use super::*;

fn id(s: &str) -> Arc<str> {
    Arc::from(s)
}

fn publish(topic: &str, payload: &'static str, qos: QoS, retain: bool) -> Publish {
    Publish::new(topic, payload, qos, retain)
}

fn targets(matcher: &TopicMatcher, p: &Publish) -> Vec<(String, QoS)> {
    let mut out: Vec<(String, QoS)> = matcher
        .publish(p)
        .into_iter()
        .map(|s| (s.client_id.to_string(), s.qos))
        .collect();
    out.sort();
    out
}

#[test_case("a/+/c", "a/b/c", true ; "plus matches middle level")]
#[test_case("a/+/c", "a/b/c/d", false ; "plus does not swallow extra level")]
#[test_case("a/#", "a", true ; "hash matches parent")]
#[test_case("a/#", "a/b", true ; "hash matches one level")]
#[test_case("a/#", "a/b/c", true ; "hash matches many levels")]
#[test_case("a/+", "a", false ; "plus needs a level")]
#[test_case("#", "anything/at/all", true ; "bare hash")]
#[test_case("+/+", "a/b", true ; "two plus")]
#[test_case("sensors/+/temp", "sensors/7/temp", true ; "sensor wildcard")]
fn test_wildcard_matching(filter: &str, topic: &str, expected: bool) {
    let matcher = TopicMatcher::new();
    matcher
        .subscribe(&id("client"), filter, QoS::AtMostOnce)
        .unwrap();
    let matched = !matcher.matches(topic, QoS::AtMostOnce).is_empty();
    assert_eq!(matched, expected);
    assert_eq!(topic_matches_filter(topic, filter), expected);
}

#[test]
fn test_hash_mid_path_rejected() {
    let matcher = TopicMatcher::new();
    let err = matcher
        .subscribe(&id("client"), "a/#/b", QoS::AtMostOnce)
        .unwrap_err();
    assert!(matches!(err, TopicError::InvalidFilter(_)));
    assert!(matcher.matches("a/x/b", QoS::AtMostOnce).is_empty());
}

#[test]
fn test_qos_downgrade() {
    let matcher = TopicMatcher::new();
    matcher
        .subscribe(&id("q1"), "t", QoS::AtLeastOnce)
        .unwrap();
    matcher
        .subscribe(&id("q2"), "t", QoS::ExactlyOnce)
        .unwrap();

    assert_eq!(
        targets(&matcher, &publish("t", "x", QoS::ExactlyOnce, false)),
        vec![
            ("q1".to_string(), QoS::AtLeastOnce),
            ("q2".to_string(), QoS::ExactlyOnce)
        ]
    );
    assert_eq!(
        targets(&matcher, &publish("t", "x", QoS::AtMostOnce, false)),
        vec![
            ("q1".to_string(), QoS::AtMostOnce),
            ("q2".to_string(), QoS::AtMostOnce)
        ]
    );
}

#[test]
fn test_overlapping_filters_deliver_once_at_highest_qos() {
    let matcher = TopicMatcher::new();
    let client = id("c");
    matcher.subscribe(&client, "a/#", QoS::AtMostOnce).unwrap();
    matcher.subscribe(&client, "a/+", QoS::ExactlyOnce).unwrap();
    matcher.subscribe(&client, "a/b", QoS::AtLeastOnce).unwrap();

    assert_eq!(
        targets(&matcher, &publish("a/b", "x", QoS::ExactlyOnce, false)),
        vec![("c".to_string(), QoS::ExactlyOnce)]
    );
}

#[test]
fn test_unsubscribe_all_removes_every_filter() {
    let matcher = TopicMatcher::new();
    let client = id("gone");
    matcher.subscribe(&client, "x/y", QoS::AtLeastOnce).unwrap();
    matcher.subscribe(&client, "x/#", QoS::AtLeastOnce).unwrap();
    matcher.subscribe(&id("stays"), "x/y", QoS::AtMostOnce).unwrap();

    assert_eq!(matcher.unsubscribe_all("gone"), 2);
    assert_eq!(
        targets(&matcher, &publish("x/y", "x", QoS::AtLeastOnce, false)),
        vec![("stays".to_string(), QoS::AtMostOnce)]
    );
}

#[test]
fn test_unsubscribe_single_filter() {
    let matcher = TopicMatcher::new();
    let client = id("c");
    matcher.subscribe(&client, "a/b", QoS::AtMostOnce).unwrap();
    assert!(matcher.unsubscribe("c", "a/b"));
    assert!(!matcher.unsubscribe("c", "a/b"));
    assert!(matcher.matches("a/b", QoS::AtMostOnce).is_empty());
}

#[test]
fn test_retained_delivered_on_subscribe() {
    let matcher = TopicMatcher::new();
    let subs = matcher.publish(&publish("status/7", "online", QoS::AtLeastOnce, true));
    assert!(subs.is_empty());
    assert_eq!(matcher.retained_count(), 1);

    let retained = matcher
        .subscribe(&id("late"), "status/7", QoS::AtMostOnce)
        .unwrap();
    assert_eq!(retained.len(), 1);
    let delivered = retained[0].to_publish(QoS::AtMostOnce);
    assert_eq!(&*delivered.topic, "status/7");
    assert_eq!(&delivered.payload[..], b"online");
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert!(delivered.retain);
}

#[test]
fn test_retained_replaced_and_cleared() {
    let matcher = TopicMatcher::new();
    matcher.publish(&publish("status/7", "one", QoS::AtMostOnce, true));
    matcher.publish(&publish("status/7", "two", QoS::AtMostOnce, true));
    let retained = matcher.retained_for("status/+");
    assert_eq!(retained.len(), 1);
    assert_eq!(&retained[0].payload[..], b"two");

    matcher.publish(&publish("status/7", "", QoS::AtMostOnce, true));
    assert!(matcher.retained_for("status/#").is_empty());
    assert_eq!(matcher.retained_count(), 0);
}

#[test]
fn test_non_retained_publish_does_not_store() {
    let matcher = TopicMatcher::new();
    matcher.publish(&publish("status/7", "x", QoS::AtMostOnce, false));
    assert_eq!(matcher.retained_count(), 0);
}

#[test]
fn test_deep_topics_never_reach_the_trie() {
    let matcher = TopicMatcher::with_max_levels(8);
    matcher.subscribe(&id("watcher"), "#", QoS::AtMostOnce).unwrap();

    let deep = vec!["a"; 30_000].join("/");
    let retained = publish(&deep, "x", QoS::AtMostOnce, true);
    assert!(matcher.publish(&retained).is_empty());
    assert_eq!(matcher.retained_count(), 0);

    assert!(matches!(
        matcher.subscribe(&id("watcher"), "a/b/c/d/e/f/g/h/#", QoS::AtMostOnce),
        Err(TopicError::InvalidFilter(_))
    ));
    assert_eq!(
        targets(&matcher, &publish("a/b/c", "x", QoS::AtMostOnce, false)),
        vec![("watcher".to_string(), QoS::AtMostOnce)]
    );
}
