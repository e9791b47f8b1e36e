use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::data::KnitId;
use super::tags::{TagError, TagSet, SYSTEM_TAG_PREFIX};

/// Identifier of a registered plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of an input mountpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputId(pub i64);

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an output mountpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(pub i64);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a system-defined plan without a container image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PseudoPlanName(String);

impl PseudoPlanName {
    /// Plan behind user uploads.
    pub const UPLOADED: &'static str = "knit#uploaded";

    /// Plan behind imported data.
    pub const IMPORTED: &'static str = "knit#imported";

    /// Accepts names carrying the reserved prefix.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.len() > SYSTEM_TAG_PREFIX.len() && name.starts_with(SYSTEM_TAG_PREFIX) {
            Some(Self(name))
        } else {
            None
        }
    }

    pub fn uploaded() -> Self {
        Self(Self::UPLOADED.to_string())
    }

    pub fn imported() -> Self {
        Self(Self::IMPORTED.to_string())
    }

    /// The pseudo plans every installation carries.
    pub fn system() -> [Self; 2] {
        [Self::uploaded(), Self::imported()]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PseudoPlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What executes a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum PlanKind {
    /// Externally originated data, no workload.
    Pseudo { name: PseudoPlanName },
    /// A container image run as a worker.
    Image { image: String, version: String },
}

/// An input mountpoint and its matching criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub input_id: InputId,
    pub path: String,
    /// Tags a candidate must carry, all of them.
    pub tags: TagSet,
    /// A candidate's timestamp must equal one of these.
    pub timestamps: BTreeSet<DateTime<Utc>>,
    /// A candidate's knit id must equal one of these.
    pub knit_ids: BTreeSet<KnitId>,
}

/// An output mountpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub output_id: OutputId,
    pub path: String,
    /// Tags attached to every data produced here.
    pub tags: TagSet,
    /// Set on the log mountpoint.
    #[serde(default)]
    pub is_log: bool,
}

/// A registered unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub active: bool,
    pub kind: PlanKind,
    pub inputs: Vec<Input>,
    /// Outputs, the log mountpoint included.
    pub outputs: Vec<Output>,
}

impl Plan {
    pub fn pseudo_name(&self) -> Option<&PseudoPlanName> {
        match &self.kind {
            PlanKind::Pseudo { name } => Some(name),
            PlanKind::Image { .. } => None,
        }
    }

    /// Rejects input tags with a reserved key.
    ///
    /// Knit id and timestamp criteria live in their own fields; any other
    /// reserved key could never be satisfied.
    pub fn check_criteria(&self) -> Result<(), TagError> {
        let reserved = self
            .inputs
            .iter()
            .flat_map(|input| input.tags.iter())
            .find(|tag| tag.is_system());
        match reserved {
            Some(tag) => Err(TagError::ReservedCriterion(tag.to_string())),
            None => Ok(()),
        }
    }

    /// Flattens each input into the form the matcher evaluates.
    pub fn criteria(&self) -> Vec<InputCriteria> {
        self.inputs
            .iter()
            .map(|input| InputCriteria {
                input_id: input.input_id,
                plan_id: self.plan_id.clone(),
                tags: input.tags.clone(),
                timestamps: input.timestamps.clone(),
                knit_ids: input.knit_ids.clone(),
            })
            .collect()
    }
}

/// Matching criteria of one input, detached from its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCriteria {
    pub input_id: InputId,
    pub plan_id: PlanId,
    pub tags: TagSet,
    pub timestamps: BTreeSet<DateTime<Utc>>,
    pub knit_ids: BTreeSet<KnitId>,
}

impl InputCriteria {
    /// Input with no criteria at all. Such inputs are never nominated.
    pub fn is_unconstrained(&self) -> bool {
        self.tags.is_empty() && self.timestamps.is_empty() && self.knit_ids.is_empty()
    }
}
