use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::{OutputId, PlanId};
use super::run::{RunId, RunStatus};
use super::tags::{Tag, TagSet};

/// Globally unique identity of a data item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnitId(pub String);

impl KnitId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A stored data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub knit_id: KnitId,
    /// Opaque storage handle.
    pub volume_ref: String,
    pub run_id: RunId,
    pub output_id: OutputId,
    pub plan_id: PlanId,
    /// User tags only; reserved tags are derived.
    pub tags: TagSet,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DataRecord {
    /// User tags plus the derived `knit#id` and `knit#timestamp`.
    pub fn full_tags(&self) -> TagSet {
        let mut tags = self.tags.user();
        tags.insert(Tag::knit_id(self.knit_id.as_str()));
        if let Some(at) = self.timestamp {
            tags.insert(Tag::timestamp(at));
        }
        tags
    }
}

/// What the matcher needs to know about a data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCandidate {
    pub knit_id: KnitId,
    pub tags: TagSet,
    pub timestamp: Option<DateTime<Utc>>,
    /// Status of the producing run.
    pub run_status: RunStatus,
}
