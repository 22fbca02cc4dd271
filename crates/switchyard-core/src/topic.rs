//! Topic pattern matching.
//!
//! Route patterns are slash-delimited like topics. A pattern segment is one of:
//!
//! - a literal, compared case-sensitively with the topic segment
//! - `:name`, binding the topic segment to `name`
//! - `*`, allowed only as the last segment, matching any remainder
//!
//! Patterns match by segment **prefix**: `admin` matches `admin/settings`
//! but not `administrator`. The root pattern (empty after normalization)
//! and `*` both match every topic.
//!
//! ```rust,ignore
//! let pattern = TopicPattern::compile("sensors/:room")?;
//! let m = pattern.matches("sensors/kitchen/temp");
//! assert!(m.matched);
//! assert_eq!(m.params["room"], "kitchen");
//! assert_eq!(m.matched_path, "sensors/kitchen");
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::PatternError;

/// Strips leading and trailing `/`.
///
/// Idempotent: a normalized string passes through unchanged.
pub fn normalize(s: &str) -> &str {
    s.trim_matches('/')
}

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Rest,
}

/// The result of testing a topic against a [`TopicPattern`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMatch {
    /// Whether the topic matched.
    pub matched: bool,
    /// Named parameters bound by `:name` segments.
    pub params: HashMap<String, String>,
    /// The prefix of the topic consumed by the pattern.
    pub matched_path: String,
}

impl TopicMatch {
    fn miss() -> Self {
        Self::default()
    }
}

/// A compiled route pattern.
#[derive(Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compiles a pattern, normalizing it first.
    ///
    /// Fails on empty segments, unnamed or badly named parameters, duplicate
    /// parameter names, and wildcards that are not a whole final segment.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let source = normalize(pattern);
        if source.is_empty() {
            return Ok(Self {
                source: String::new(),
                segments: Vec::new(),
            });
        }

        let parts: Vec<&str> = source.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut seen = HashSet::new();

        for (position, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(PatternError::EmptySegment {
                        pattern: source.to_string(),
                        position,
                    });
                }
                "*" if position + 1 == parts.len() => Segment::Rest,
                p if p.contains('*') => {
                    return Err(PatternError::MisplacedWildcard {
                        pattern: source.to_string(),
                    });
                }
                p => match p.strip_prefix(':') {
                    Some("") => {
                        return Err(PatternError::MissingParamName {
                            pattern: source.to_string(),
                            position,
                        });
                    }
                    Some(name) => {
                        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                            return Err(PatternError::InvalidParamName {
                                pattern: source.to_string(),
                                name: name.to_string(),
                            });
                        }
                        if !seen.insert(name) {
                            return Err(PatternError::DuplicateParam {
                                pattern: source.to_string(),
                                name: name.to_string(),
                            });
                        }
                        Segment::Param(name.to_string())
                    }
                    None => Segment::Literal(p.to_string()),
                },
            };
            segments.push(segment);
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Returns the normalized pattern text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `true` if this pattern matches every topic.
    pub fn is_catch_all(&self) -> bool {
        matches!(self.segments.as_slice(), [] | [Segment::Rest])
    }

    /// Tests `topic` against this pattern. The topic is normalized first.
    pub fn matches(&self, topic: &str) -> TopicMatch {
        let topic = normalize(topic);
        let parts: Vec<&str> = if topic.is_empty() {
            Vec::new()
        } else {
            topic.split('/').collect()
        };

        let mut params = HashMap::new();
        let mut consumed = 0;

        for segment in &self.segments {
            match segment {
                Segment::Rest => {
                    consumed = parts.len();
                    break;
                }
                Segment::Literal(lit) => match parts.get(consumed) {
                    Some(part) if *part == lit.as_str() => consumed += 1,
                    _ => return TopicMatch::miss(),
                },
                Segment::Param(name) => match parts.get(consumed) {
                    Some(part) if !part.is_empty() => {
                        params.insert(name.clone(), (*part).to_string());
                        consumed += 1;
                    }
                    _ => return TopicMatch::miss(),
                },
            }
        }

        TopicMatch {
            matched: true,
            params,
            matched_path: parts[..consumed].join("/"),
        }
    }

    /// Like [`matches`](Self::matches), returning `None` on a miss.
    pub fn find(&self, topic: &str) -> Option<TopicMatch> {
        let m = self.matches(topic);
        m.matched.then_some(m)
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
