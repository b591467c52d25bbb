//! Path-based text extraction from decoded provider responses.
//!
//! Each provider declares where its generated text lives as an ordered list of
//! segments (mapping keys and sequence indices). [`extract`] walks that path and
//! fails closed on the first mismatch; it never panics on malformed input.

use std::fmt;
use std::str::FromStr;

use chorus_types::{ChorusError, ExtractionFailure, Extracted};
use serde_json::Value;

// ---------------------------------------------------------------------------
// PathSegment / ResponsePath
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Ordered location of the generated text inside a response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResponsePath {
    segments: Vec<PathSegment>,
}

impl ResponsePath {
    /// An empty path: the response itself must be the text.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.segments.push(PathSegment::from(key));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.segments.push(PathSegment::Index(index));
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}

/// Dotted form, e.g. `choices.0.message.content`.
impl fmt::Display for ResponsePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Parses the dotted form. All-digit segments are indices.
impl FromStr for ResponsePath {
    type Err = ChorusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let segments = s
            .split('.')
            .map(|part| {
                if part.is_empty() {
                    return Err(ChorusError::Config(format!(
                        "empty segment in response path '{s}'"
                    )));
                }
                Ok(match part.parse::<usize>() {
                    Ok(i) if part.bytes().all(|b| b.is_ascii_digit()) => PathSegment::Index(i),
                    _ => PathSegment::Key(part.to_string()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Walk `path` through `raw` and return the trimmed text leaf.
///
/// No partial result is ever returned: any segment that does not match the
/// cursor's shape, or a leaf that is not a string, yields
/// [`ExtractionFailure::Path`].
pub fn extract(path: &ResponsePath, raw: &Value) -> Extracted {
    let mut cursor = raw;
    for segment in path.segments() {
        let next = match (segment, cursor) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(value) => cursor = value,
            None => return Extracted::Failed(ExtractionFailure::Path),
        }
    }

    match cursor.as_str() {
        Some(text) => Extracted::Text(text.trim().to_string()),
        None => Extracted::Failed(ExtractionFailure::Path),
    }
}

/// Like [`extract`], for a provider that may not have declared a path.
pub fn extract_for(path: Option<&ResponsePath>, raw: &Value) -> Extracted {
    match path {
        Some(path) => extract(path, raw),
        None => Extracted::Failed(ExtractionFailure::UnsupportedProvider),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
