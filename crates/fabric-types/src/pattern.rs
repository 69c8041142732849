//! # Topic Patterns
//!
//! Subscription patterns use topic-exchange wildcard semantics:
//!
//! - a literal segment matches itself
//! - `*` matches exactly one segment
//! - `#` matches zero or more remaining segments and must be final
//!
//! This is the single matching implementation shared by broker dispatch and
//! `ChannelRegistry::find_by_pattern`, so a preview of a pattern always
//! agrees with what dispatch will do.

use crate::channel::is_valid_segment;
use crate::errors::PatternError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    /// `*` - exactly one segment.
    Single,
    /// `#` - zero or more trailing segments.
    Multi,
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl TopicPattern {
    /// Parse and validate a pattern.
    ///
    /// # Errors
    ///
    /// - `PatternError::Invalid` for empty/malformed segments
    /// - `PatternError::MultiWildcardNotLast` if `#` is not final
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Invalid {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let segments: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(segments.len());

        for (index, segment) in segments.iter().enumerate() {
            match *segment {
                "*" => tokens.push(PatternToken::Single),
                "#" => {
                    if index != segments.len() - 1 {
                        return Err(PatternError::MultiWildcardNotLast {
                            pattern: pattern.to_string(),
                        });
                    }
                    tokens.push(PatternToken::Multi);
                }
                literal => {
                    if !is_valid_segment(literal) {
                        return Err(PatternError::Invalid {
                            pattern: pattern.to_string(),
                            reason: format!("invalid segment '{literal}'"),
                        });
                    }
                    tokens.push(PatternToken::Literal(literal.to_string()));
                }
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcards (a concrete name).
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        self.tokens
            .iter()
            .all(|t| matches!(t, PatternToken::Literal(_)))
    }

    /// Match this pattern against a concrete channel name.
    #[must_use]
    pub fn matches(&self, channel: &str) -> bool {
        let segments: Vec<&str> = channel.split('.').collect();
        let mut seg = 0;

        for (index, token) in self.tokens.iter().enumerate() {
            match token {
                PatternToken::Multi => {
                    // `#` is always final: it absorbs whatever remains,
                    // including nothing.
                    debug_assert_eq!(index, self.tokens.len() - 1);
                    return true;
                }
                PatternToken::Single => {
                    if seg >= segments.len() {
                        return false;
                    }
                    seg += 1;
                }
                PatternToken::Literal(literal) => {
                    if seg >= segments.len() || segments[seg] != literal {
                        return false;
                    }
                    seg += 1;
                }
            }
        }

        seg == segments.len()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> TopicPattern {
        TopicPattern::parse(p).expect("valid pattern")
    }

    #[test]
    fn test_literal_match() {
        assert!(pattern("agents.test.message").matches("agents.test.message"));
        assert!(!pattern("agents.test.message").matches("agents.test.other"));
    }

    #[test]
    fn test_single_wildcard_one_segment() {
        let p = pattern("agents.*.message");
        assert!(p.matches("agents.test.message"));
        assert!(!p.matches("agents.a.b.message"));
        assert!(!p.matches("agents.message"));
    }

    #[test]
    fn test_multi_wildcard_zero_or_more() {
        let p = pattern("agents.#");
        assert!(p.matches("agents.test.message"));
        assert!(p.matches("agents.a.b.c"));
        assert!(p.matches("agents"));
        assert!(!p.matches("services.a"));
    }

    #[test]
    fn test_multi_wildcard_must_be_last() {
        assert!(matches!(
            TopicPattern::parse("agents.#.message"),
            Err(PatternError::MultiWildcardNotLast { .. })
        ));
    }

    #[test]
    fn test_invalid_segments_rejected() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("agents..message").is_err());
        assert!(TopicPattern::parse("agents.me ssage").is_err());
    }

    #[test]
    fn test_is_concrete() {
        assert!(pattern("agents.test.message").is_concrete());
        assert!(!pattern("agents.*.message").is_concrete());
        assert!(!pattern("agents.#").is_concrete());
    }

    #[test]
    fn test_trailing_wildcard_star() {
        let p = pattern("agents.broadcast.*");
        assert!(p.matches("agents.broadcast.shutdown"));
        assert!(!p.matches("agents.broadcast.a.b"));
        assert!(!p.matches("agents.broadcast"));
    }
}
