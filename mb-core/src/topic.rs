//! Topic and subscription-pattern validation and canonicalization.
//!
//! A canonical topic is a dot-separated sequence of 1-5 segments, each
//! matching `[a-z][a-z0-9]*`, case-insensitive at the wire but normalized
//! to lower-case for storage and comparison. Subscription patterns extend
//! the grammar with `+` (exactly one level) as a full segment, and a
//! trailing `#` (zero or more levels) as the last segment.

use std::fmt;

/// Maximum number of dot-separated segments in a topic or pattern.
pub const MAX_SEGMENTS: usize = 5;

/// Maximum total length (in bytes) of a canonical topic or pattern string.
pub const MAX_LENGTH: usize = 255;

/// Prefix that marks a topic as belonging to the service registry's
/// control plane rather than to ordinary pub/sub routing.
pub const SYSTEM_PREFIX: &str = "system.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic exceeds maximum length of {MAX_LENGTH} bytes")]
    TooLong,
    #[error("topic has more than {MAX_SEGMENTS} segments")]
    TooDeep,
    #[error("segment {0:?} is invalid")]
    InvalidSegment(String),
    #[error("'#' wildcard is only permitted as the final segment")]
    HashNotLast,
    #[error("wildcards are not permitted in a concrete topic")]
    WildcardNotAllowed,
}

/// One token of a parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternToken {
    Literal(String),
    /// `+` - matches exactly one level.
    Plus,
    /// `#` - matches zero or more trailing levels. Only legal as the last token.
    Hash,
}

fn is_valid_segment(seg: &str) -> bool {
    let mut chars = seg.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Lower-cases and validates a concrete (wildcard-free) topic.
///
/// Returns the canonical form on success.
pub fn canonicalize_topic(raw: &str) -> Result<String, TopicError> {
    let lower = raw.to_ascii_lowercase();
    check_shape(&lower)?;
    for seg in lower.split('.') {
        if seg == "+" || seg == "#" {
            return Err(TopicError::WildcardNotAllowed);
        }
        if !is_valid_segment(seg) {
            return Err(TopicError::InvalidSegment(seg.to_string()));
        }
    }
    Ok(lower)
}

/// Lower-cases, validates, and tokenizes a subscription pattern, which may
/// contain `+` segments and a single trailing `#` segment.
pub fn parse_pattern(raw: &str) -> Result<Vec<PatternToken>, TopicError> {
    let lower = raw.to_ascii_lowercase();
    check_shape(&lower)?;

    let segs: Vec<&str> = lower.split('.').collect();
    let mut tokens = Vec::with_capacity(segs.len());
    for (idx, seg) in segs.iter().enumerate() {
        if *seg == "#" {
            if idx != segs.len() - 1 {
                return Err(TopicError::HashNotLast);
            }
            tokens.push(PatternToken::Hash);
        } else if *seg == "+" {
            tokens.push(PatternToken::Plus);
        } else if is_valid_segment(seg) {
            tokens.push(PatternToken::Literal(seg.to_string()));
        } else {
            return Err(TopicError::InvalidSegment(seg.to_string()));
        }
    }
    Ok(tokens)
}

fn check_shape(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_LENGTH {
        return Err(TopicError::TooLong);
    }
    if topic.starts_with('.') || topic.ends_with('.') || topic.contains("..") {
        return Err(TopicError::InvalidSegment(topic.to_string()));
    }
    let depth = topic.matches('.').count() + 1;
    if depth > MAX_SEGMENTS {
        return Err(TopicError::TooDeep);
    }
    Ok(())
}

/// Whether a canonical topic is part of the `system.*` control plane.
pub fn is_system_topic(canonical_topic: &str) -> bool {
    canonical_topic.starts_with(SYSTEM_PREFIX)
}

impl fmt::Display for PatternToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternToken::Literal(s) => write!(f, "{s}"),
            PatternToken::Plus => write!(f, "+"),
            PatternToken::Hash => write!(f, "#"),
        }
    }
}
