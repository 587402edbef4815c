//! Topic utilities: level splitting, wildcard matching and rendering.

use crate::error::{Error, Result};

/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";
/// Multi-level wildcard, only valid as the last level.
pub const MULTI_LEVEL: &str = "#";

/// Split a topic into its levels. Leading and trailing separators are dropped.
pub fn split_levels(topic: &str) -> Vec<String> {
    let trimmed = topic.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').map(str::to_string).collect()
}

/// Check that a subscription filter is well formed.
pub fn validate_filter(filter: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidMapping(format!("topic '{}': {}", filter, reason));

    let levels = split_levels(filter);
    if levels.is_empty() {
        return Err(invalid("empty topic"));
    }
    for (i, level) in levels.iter().enumerate() {
        if level.is_empty() {
            return Err(invalid("empty level"));
        }
        if level.contains('#') {
            if level != MULTI_LEVEL {
                return Err(invalid("'#' must occupy a whole level"));
            }
            if i != levels.len() - 1 {
                return Err(invalid("'#' is only allowed as the last level"));
            }
        }
        if level.contains('+') && level != SINGLE_LEVEL {
            return Err(invalid("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_levels = split_levels(filter);
    let topic_levels = split_levels(topic);

    for (i, level) in filter_levels.iter().enumerate() {
        if level == MULTI_LEVEL {
            return true;
        }
        match topic_levels.get(i) {
            Some(_) if level == SINGLE_LEVEL => {}
            Some(t) if t == level => {}
            _ => return false,
        }
    }
    filter_levels.len() == topic_levels.len()
}

/// Number of non-wildcard levels; more specific filters win when several match.
pub fn specificity(filter: &str) -> usize {
    split_levels(filter)
        .iter()
        .filter(|l| *l != SINGLE_LEVEL && *l != MULTI_LEVEL)
        .count()
}

/// Fill wildcard levels of an outbound topic with the device's external id.
pub fn render_publish_topic(template: &str, external_id: Option<&str>) -> String {
    let Some(id) = external_id else {
        return template.to_string();
    };
    template
        .split('/')
        .map(|level| {
            if level == SINGLE_LEVEL || level == MULTI_LEVEL {
                id
            } else {
                level
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Replace level `index` of a topic, padding missing levels with empty ones.
pub fn replace_level(topic: &str, index: usize, value: &str) -> String {
    let leading = topic.starts_with('/');
    let mut levels = split_levels(topic);
    if index >= levels.len() {
        levels.resize(index + 1, String::new());
    }
    levels[index] = value.to_string();
    let joined = levels.join("/");
    if leading {
        format!("/{}", joined)
    } else {
        joined
    }
}
