//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the whole last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by a leading wildcard
//! - Names and filters are limited in depth (the trie walks one frame per level)

use super::TopicError;

/// Longest topic name or filter that fits a length-prefixed string
const MAX_TOPIC_LEN: usize = 65535;

/// Hard ceiling on topic levels, applied even when no limit is configured
pub const MAX_TOPIC_LEVELS: usize = 1024;

/// Level limit in effect for a configured value (0 = the hard ceiling)
pub fn effective_max_levels(max_topic_levels: usize) -> usize {
    if max_topic_levels == 0 {
        MAX_TOPIC_LEVELS
    } else {
        max_topic_levels.min(MAX_TOPIC_LEVELS)
    }
}

/// Validate a topic name (used in PUBLISH and wills)
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_topic_name_with_max_levels(topic, 0)
}

/// Validate a topic name against a configured level limit
pub fn validate_topic_name_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::InvalidTopic("topic name cannot be empty"));
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::InvalidTopic("topic name exceeds maximum length"));
    }

    if topic.contains('\0') {
        return Err(TopicError::InvalidTopic(
            "topic name cannot contain null character",
        ));
    }

    if topic.contains(['+', '#']) {
        return Err(TopicError::InvalidTopic(
            "topic name cannot contain wildcards",
        ));
    }

    if topic.split('/').count() > effective_max_levels(max_topic_levels) {
        return Err(TopicError::InvalidTopic(
            "topic exceeds maximum allowed levels",
        ));
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_topic_filter_with_max_levels(filter, 0)
}

/// Validate a topic filter against a configured level limit
pub fn validate_topic_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::InvalidFilter("topic filter cannot be empty"));
    }

    if filter.len() > MAX_TOPIC_LEN {
        return Err(TopicError::InvalidFilter(
            "topic filter exceeds maximum length",
        ));
    }

    if filter.contains('\0') {
        return Err(TopicError::InvalidFilter(
            "topic filter cannot contain null character",
        ));
    }

    if filter.split('/').count() > effective_max_levels(max_topic_levels) {
        return Err(TopicError::InvalidFilter(
            "topic filter exceeds maximum allowed levels",
        ));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err(TopicError::InvalidFilter(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if levels.peek().is_some() {
                return Err(TopicError::InvalidFilter(
                    "multi-level wildcard must be last level",
                ));
            }
        }

        if level.contains('+') && level != "+" {
            return Err(TopicError::InvalidFilter(
                "single-level wildcard must occupy entire level",
            ));
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Reference implementation of the trie's matching rules, used by the ACL
/// checks and in tests:
/// - `+` matches exactly one level
/// - `#` matches the parent level and any number of levels below it
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
