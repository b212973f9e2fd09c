// src/messaging/topic.rs
// Topic helpers: remote prefix and wildcard matching

use crate::error::{PortalError, Result};
use regex::Regex;

/// Topics starting with this marker are routed through remote messaging
pub const REMOTE_PREFIX: &str = "remote:";

/// Matches exactly one path segment
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Matches zero or more trailing path segments; only valid as the last segment
pub const MULTI_LEVEL_WILDCARD: &str = "#";

pub fn is_remote(topic: &str) -> bool {
    topic.starts_with(REMOTE_PREFIX)
}

/// The server-side part of a remote topic
pub fn strip_remote(topic: &str) -> Option<&str> {
    topic.strip_prefix(REMOTE_PREFIX)
}

pub fn contains_wildcard(topic: &str) -> bool {
    topic
        .split('/')
        .any(|s| s == SINGLE_LEVEL_WILDCARD || s == MULTI_LEVEL_WILDCARD)
}

/// Reject empty topics and topics with empty segments
pub fn validate(topic: &str) -> Result<()> {
    let name = strip_remote(topic).unwrap_or(topic);
    if name.is_empty() || name.split('/').any(str::is_empty) {
        return Err(PortalError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Translate a subscription pattern into an anchored regular expression
pub fn pattern_to_regex(pattern: &str) -> Result<Regex> {
    let segments: Vec<&str> = pattern.split('/').collect();
    let mut expr = String::from("^");

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if *segment == MULTI_LEVEL_WILDCARD {
            if !last {
                return Err(PortalError::InvalidTopic(pattern.to_string()));
            }
            if i == 0 {
                expr.push_str(".*");
            } else {
                // "a/#" matches "a" itself as well as everything below it
                expr.push_str("(/.*)?");
            }
            break;
        }
        if i > 0 {
            expr.push('/');
        }
        if *segment == SINGLE_LEVEL_WILDCARD {
            expr.push_str("[^/]+");
        } else {
            expr.push_str(&regex::escape(segment));
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| PortalError::InvalidTopic(format!("{}: {}", pattern, e)))
}

/// Whether `topic` is matched by the subscription `pattern`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if !contains_wildcard(pattern) {
        return false;
    }
    pattern_to_regex(pattern)
        .map(|re| re.is_match(topic))
        .unwrap_or(false)
}
