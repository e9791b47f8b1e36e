//! Key/value tags attached to data and declared as input criteria.
//!
//! Tags whose key starts with [`SYSTEM_TAG_PREFIX`] are reserved. They are
//! derived from data identity and lifecycle, never written by users.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of every reserved tag key.
pub const SYSTEM_TAG_PREFIX: &str = "knit#";

/// Reserved key carrying the data's knit id.
pub const KEY_KNIT_ID: &str = "knit#id";

/// Reserved key carrying the data's timestamp (RFC 3339).
pub const KEY_KNIT_TIMESTAMP: &str = "knit#timestamp";

/// Errors raised while parsing tags.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    /// The text has no `:` separator.
    #[error("tag '{0}' is not in key:value form")]
    MissingSeparator(String),

    /// The key is empty after trimming.
    #[error("tag '{0}' has an empty key")]
    EmptyKey(String),

    /// A reserved key was given a value it cannot hold.
    #[error("invalid value for system tag {key}: {message}")]
    InvalidSystemValue { key: String, message: String },

    /// An input criterion used a reserved key.
    #[error("input criterion '{0}' uses a reserved key")]
    ReservedCriterion(String),
}

/// A single `key:value` label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    /// Creates a tag, trimming both sides.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into().trim().to_string(),
            value: value.into().trim().to_string(),
        }
    }

    /// Builds the reserved `knit#id` tag.
    pub fn knit_id(knit_id: &str) -> Self {
        Self::new(KEY_KNIT_ID, knit_id)
    }

    /// Builds the reserved `knit#timestamp` tag in RFC 3339 form.
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Self::new(KEY_KNIT_TIMESTAMP, at.to_rfc3339())
    }

    pub fn is_system(&self) -> bool {
        self.key.starts_with(SYSTEM_TAG_PREFIX)
    }

    /// Parses the value of a `knit#timestamp` tag.
    ///
    /// Returns `None` for tags with any other key.
    pub fn as_timestamp(&self) -> Option<Result<DateTime<Utc>, TagError>> {
        if self.key != KEY_KNIT_TIMESTAMP {
            return None;
        }
        Some(parse_timestamp(&self.value))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((key, value)) = s.split_once(':') else {
            return Err(TagError::MissingSeparator(s.to_string()));
        };
        let tag = Tag::new(key, value);
        if tag.key.is_empty() {
            return Err(TagError::EmptyKey(s.to_string()));
        }
        if let Some(Err(e)) = tag.as_timestamp() {
            return Err(e);
        }
        Ok(tag)
    }
}

/// Parses an RFC 3339 timestamp and normalises it to UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, TagError> {
    DateTime::<FixedOffset>::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TagError::InvalidSystemValue {
            key: KEY_KNIT_TIMESTAMP.to_string(),
            message: e.to_string(),
        })
}

/// An ordered, deduplicated set of tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag) -> bool {
        self.0.insert(tag)
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    /// True when every tag of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &TagSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Tags without a reserved key.
    pub fn user(&self) -> TagSet {
        self.iter().filter(|t| !t.is_system()).cloned().collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TagSet {
    type Item = Tag;
    type IntoIter = std::collections::btree_set::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::collections::btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
