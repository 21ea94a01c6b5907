//! Path pattern parsing and specificity.
//!
//! # Responsibilities
//! - Split patterns into literal, parameter and wildcard segments
//! - Normalize request paths into segments
//! - Rank patterns so that literal > parameter > wildcard, left to right
//! - Capture named parameters for a matched route
//!
//! # Design Decisions
//! - Malformed patterns are accepted structurally; a wildcard that is not the
//!   last segment simply never matches
//! - Query strings and empty segments are ignored (`/a//b/?x=1` == `/a/b`)

use std::cmp::Ordering;
use std::fmt;

/// Name used to capture an unnamed `**` wildcard.
pub const WILDCARD_CAPTURE: &str = "_";

/// One segment of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Must equal the path segment exactly.
    Literal(String),
    /// Matches exactly one path segment (`:name` or `*`).
    Param(String),
    /// Matches the remaining zero or more segments (`**` or `**:name`).
    Wildcard(Option<String>),
}

impl Segment {
    fn rank(&self) -> Rank {
        match self {
            Segment::Literal(_) => Rank::Literal,
            Segment::Param(_) => Rank::Param,
            Segment::Wildcard(_) => Rank::Wildcard,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(value) => write!(f, "{}", value),
            Segment::Param(name) => write!(f, ":{}", name),
            Segment::Wildcard(None) => write!(f, "**"),
            Segment::Wildcard(Some(name)) => write!(f, "**:{}", name),
        }
    }
}

/// Parse a route pattern into segments.
pub fn parse_pattern(pattern: &str) -> Vec<Segment> {
    let mut unnamed = 0usize;
    split_path(pattern)
        .into_iter()
        .map(|raw| {
            if raw == "**" {
                Segment::Wildcard(None)
            } else if let Some(name) = raw.strip_prefix("**:") {
                Segment::Wildcard(Some(name.to_string()))
            } else if raw == "*" {
                let name = format!("_{}", unnamed);
                unnamed += 1;
                Segment::Param(name)
            } else if let Some(name) = raw.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(raw.to_string())
            }
        })
        .collect()
}

/// Split a request path into its non-empty segments, dropping any query string.
pub fn split_path(path: &str) -> Vec<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Returns true if the parsed pattern covers the given path segments.
pub fn matches_segments(segments: &[Segment], path: &[&str]) -> bool {
    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Wildcard(_) => return i + 1 == segments.len(),
            Segment::Literal(value) => {
                if path.get(i) != Some(&value.as_str()) {
                    return false;
                }
            }
            Segment::Param(_) => {
                if i >= path.len() {
                    return false;
                }
            }
        }
    }
    path.len() == segments.len()
}

/// Match-all coverage: a bare `/` covers every path, other patterns behave
/// as in [`matches_segments`].
pub fn covers_segments(segments: &[Segment], path: &[&str]) -> bool {
    segments.is_empty() || matches_segments(segments, path)
}

/// Parameters captured from a matched path, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Capture parameters of `segments` from an already matched `path`.
    pub fn capture(segments: &[Segment], path: &[&str]) -> Self {
        let mut params = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            match segment {
                Segment::Literal(_) => {}
                Segment::Param(name) => {
                    if let Some(value) = path.get(i) {
                        params.push((name.clone(), value.to_string()));
                    }
                }
                Segment::Wildcard(name) => {
                    let rest = path.get(i..).map(|s| s.join("/")).unwrap_or_default();
                    let name = name.as_deref().unwrap_or(WILDCARD_CAPTURE);
                    params.push((name.to_string(), rest));
                    break;
                }
            }
        }
        Self(params)
    }

    /// Look up a captured parameter by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Rank {
    Wildcard,
    Param,
    Literal,
    /// The pattern ends exactly where the path ends.
    End,
}

/// Comparable specificity of a pattern.
///
/// Ranks are compared segment by segment from the left, so `/a/b` beats
/// `/a/:x` beats `/a/**`, and `/a` beats `/a/**` for the path `/a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Specificity(Vec<Rank>);

impl Specificity {
    pub fn of(segments: &[Segment]) -> Self {
        let mut ranks: Vec<Rank> = segments.iter().map(Segment::rank).collect();
        if !matches!(segments.last(), Some(Segment::Wildcard(_))) {
            ranks.push(Rank::End);
        }
        Self(ranks)
    }

    /// Ordering key for match-all results, where a bare `/` ranks as a
    /// catch-all.
    pub fn covering(segments: &[Segment]) -> Self {
        if segments.is_empty() {
            Self(vec![Rank::Wildcard])
        } else {
            Self::of(segments)
        }
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
