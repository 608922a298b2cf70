//! Attribute paths.
//!
//! The `A` of a triple: ordered string segments, always prefixed by the
//! collection name for user data. `_collection` markers are the one
//! exception - they sit outside any collection prefix.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute of the synthetic collection-membership marker triple.
pub const COLLECTION_MARKER: &str = "_collection";

/// Ordered path addressing one leaf (or subtree) of a document.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrPath(Vec<String>);

impl AttrPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_slice(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }

    pub fn marker() -> Self {
        Self(vec![COLLECTION_MARKER.to_string()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Path with one more trailing segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Path without the trailing segment, with that segment.
    pub fn split_last(&self) -> Option<(Self, &str)> {
        let (last, head) = self.0.split_last()?;
        Some((Self(head.to_vec()), last.as_str()))
    }

    pub fn starts_with(&self, prefix: &AttrPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Segments after `prefix`; `None` when this path does not extend it.
    pub fn strip_prefix(&self, prefix: &AttrPath) -> Option<&[String]> {
        self.starts_with(prefix).then(|| &self.0[prefix.0.len()..])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn into_segments(self) -> Vec<String> {
        self.0
    }
}

impl fmt::Debug for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrPath({})", self)
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<Vec<String>> for AttrPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl FromIterator<String> for AttrPath {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
