//! Topic and Pattern Grammar
//!
//! Topics are dot-segmented strings such as `user.profile.update`. A
//! subscription pattern is one of four forms:
//!
//! - Exact: `user.login` matches only `user.login`
//! - Prefix: `user.*` matches `user.login`, `user.profile.update`
//! - Suffix: `*.update` matches `user.profile.update`, `order.update`
//! - Complex: `user.*.update` matches `user.profile.update` but not
//!   `user.profile.photo.update`
//!
//! Anything else (a bare `*`, several wildcards, partial-segment wildcards such
//! as `user*`, empty segments) is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::BusError;

/// Segment separator for topics and patterns
pub const SEGMENT_SEPARATOR: char = '.';

/// The wildcard segment
pub const WILDCARD: &str = "*";

// ─────────────────────────────────────────────────────────────────────────────
// Pattern Kind
// ─────────────────────────────────────────────────────────────────────────────

/// Which index a pattern is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Exact,
    Prefix,
    Suffix,
    Complex,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Exact => write!(f, "exact"),
            PatternKind::Prefix => write!(f, "prefix"),
            PatternKind::Suffix => write!(f, "suffix"),
            PatternKind::Complex => write!(f, "complex"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Topic Pattern
// ─────────────────────────────────────────────────────────────────────────────

/// A validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// No wildcard
    Exact { topic: String },

    /// `a.b.*`; `segments` holds the fixed part (`["a", "b"]`)
    Prefix { raw: String, segments: Vec<String> },

    /// `*.b.c`; `segments` holds the fixed part (`["b", "c"]`)
    Suffix { raw: String, segments: Vec<String> },

    /// `a.*.c`; the wildcard sits at `wildcard_index`
    Complex {
        raw: String,
        segments: Vec<String>,
        wildcard_index: usize,
    },
}

impl TopicPattern {
    /// Parse and classify a pattern
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        let invalid = |reason: &str| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if pattern == WILDCARD {
            return Err(invalid("a bare '*' would match every topic"));
        }

        let segments: Vec<&str> = pattern.split(SEGMENT_SEPARATOR).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty segment"));
        }
        if segments
            .iter()
            .any(|s| s.contains('*') && *s != WILDCARD)
        {
            return Err(invalid("'*' must occupy a whole segment"));
        }

        let wildcards: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == WILDCARD)
            .map(|(i, _)| i)
            .collect();

        let owned = |skip: Option<usize>| -> Vec<String> {
            segments
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .map(|(_, s)| (*s).to_string())
                .collect()
        };

        match wildcards.as_slice() {
            [] => Ok(TopicPattern::Exact {
                topic: pattern.to_string(),
            }),
            [index] if *index == segments.len() - 1 => Ok(TopicPattern::Prefix {
                raw: pattern.to_string(),
                segments: owned(Some(*index)),
            }),
            [0] => Ok(TopicPattern::Suffix {
                raw: pattern.to_string(),
                segments: owned(Some(0)),
            }),
            [index] => Ok(TopicPattern::Complex {
                raw: pattern.to_string(),
                segments: owned(None),
                wildcard_index: *index,
            }),
            _ => Err(invalid("only one wildcard segment is allowed")),
        }
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        match self {
            TopicPattern::Exact { topic } => topic,
            TopicPattern::Prefix { raw, .. }
            | TopicPattern::Suffix { raw, .. }
            | TopicPattern::Complex { raw, .. } => raw,
        }
    }

    pub fn kind(&self) -> PatternKind {
        match self {
            TopicPattern::Exact { .. } => PatternKind::Exact,
            TopicPattern::Prefix { .. } => PatternKind::Prefix,
            TopicPattern::Suffix { .. } => PatternKind::Suffix,
            TopicPattern::Complex { .. } => PatternKind::Complex,
        }
    }

    /// Number of segments in the pattern, wildcard included
    pub fn depth(&self) -> usize {
        match self {
            TopicPattern::Exact { topic } => topic.split(SEGMENT_SEPARATOR).count(),
            TopicPattern::Prefix { segments, .. } | TopicPattern::Suffix { segments, .. } => {
                segments.len() + 1
            }
            TopicPattern::Complex { segments, .. } => segments.len(),
        }
    }

    /// Check a topic against this pattern by direct comparison.
    ///
    /// This is the reference semantics; indexed lookups must agree with it.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact { topic: exact } => exact == topic,
            TopicPattern::Prefix { segments, .. } => {
                let parts: Vec<&str> = topic.split(SEGMENT_SEPARATOR).collect();
                parts.len() > segments.len()
                    && segments.iter().zip(&parts).all(|(a, b)| a == b)
            }
            TopicPattern::Suffix { segments, .. } => {
                let parts: Vec<&str> = topic.split(SEGMENT_SEPARATOR).collect();
                parts.len() > segments.len()
                    && segments.iter().rev().zip(parts.iter().rev()).all(|(a, b)| a == b)
            }
            TopicPattern::Complex { segments, wildcard_index, .. } => {
                let parts: Vec<&str> = topic.split(SEGMENT_SEPARATOR).collect();
                parts.len() == segments.len()
                    && segments
                        .iter()
                        .zip(&parts)
                        .enumerate()
                        .all(|(i, (a, b))| i == *wildcard_index || a == b)
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a concrete topic used for publishing
///
/// Topics may not be empty, may not contain empty segments, and may not contain
/// the wildcard character.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    let invalid = |reason: &str| BusError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.is_empty() {
        return Err(invalid("topic is empty"));
    }
    if topic.contains('*') {
        return Err(invalid("wildcards are not allowed in published topics"));
    }
    if topic.split(SEGMENT_SEPARATOR).any(str::is_empty) {
        return Err(invalid("empty segment"));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(TopicPattern::parse("user.login").unwrap().kind(), PatternKind::Exact);
        assert_eq!(TopicPattern::parse("user.*").unwrap().kind(), PatternKind::Prefix);
        assert_eq!(TopicPattern::parse("*.update").unwrap().kind(), PatternKind::Suffix);
        assert_eq!(TopicPattern::parse("a.*.c").unwrap().kind(), PatternKind::Complex);
        assert_eq!(TopicPattern::parse("single").unwrap().kind(), PatternKind::Exact);
    }

    #[test]
    fn test_rejected_forms() {
        for pattern in ["", "*", "a.*.*", "*.a.*", "a..b", ".a", "a.", "user*", "a.b*.c"] {
            let result = TopicPattern::parse(pattern);
            assert!(
                matches!(result, Err(BusError::InvalidPattern { .. })),
                "expected '{}' to be rejected",
                pattern
            );
        }
    }

    #[test]
    fn test_prefix_matching() {
        let pattern = TopicPattern::parse("order.*").unwrap();
        assert!(pattern.matches("order.created"));
        assert!(pattern.matches("order.created.eu"));
        assert!(!pattern.matches("order"));
        assert!(!pattern.matches("orders.created"));
        assert!(!pattern.matches("billing.created"));
    }

    #[test]
    fn test_suffix_matching() {
        let pattern = TopicPattern::parse("*.update").unwrap();
        assert!(pattern.matches("user.update"));
        assert!(pattern.matches("user.profile.update"));
        assert!(!pattern.matches("update"));
        assert!(!pattern.matches("user.updates"));
    }

    #[test]
    fn test_complex_matching() {
        let pattern = TopicPattern::parse("user.*.update").unwrap();
        assert!(pattern.matches("user.profile.update"));
        assert!(pattern.matches("user.settings.update"));
        assert!(!pattern.matches("user.profile.photo.update"));
        assert!(!pattern.matches("user.update"));
        assert!(!pattern.matches("admin.profile.update"));
    }

    #[test]
    fn test_depth() {
        assert_eq!(TopicPattern::parse("a.b.c").unwrap().depth(), 3);
        assert_eq!(TopicPattern::parse("a.b.*").unwrap().depth(), 3);
        assert_eq!(TopicPattern::parse("*.c").unwrap().depth(), 2);
        assert_eq!(TopicPattern::parse("a.*.c").unwrap().depth(), 3);
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("user.login").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("user.*").is_err());
        assert!(validate_topic("user..login").is_err());
    }
}
