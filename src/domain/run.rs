//! Run identity, status and the transition graph.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::data::{DataRecord, KnitId};
use super::plan::{InputId, PlanId};

/// Identifier of a run. Survives retries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Deactivated,
    Waiting,
    Ready,
    Starting,
    Running,
    Aborting,
    Completing,
    Done,
    Failed,
    Invalidated,
}

impl RunStatus {
    pub const ALL: [RunStatus; 10] = [
        RunStatus::Deactivated,
        RunStatus::Waiting,
        RunStatus::Ready,
        RunStatus::Starting,
        RunStatus::Running,
        RunStatus::Aborting,
        RunStatus::Completing,
        RunStatus::Done,
        RunStatus::Failed,
        RunStatus::Invalidated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Deactivated => "deactivated",
            RunStatus::Waiting => "waiting",
            RunStatus::Ready => "ready",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Aborting => "aborting",
            RunStatus::Completing => "completing",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Invalidated => "invalidated",
        }
    }

    /// Where `finish` takes a run from this status, if anywhere.
    pub fn finish_target(self) -> Option<RunStatus> {
        match self {
            RunStatus::Completing => Some(RunStatus::Done),
            RunStatus::Aborting => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// `Done` or `Failed`: an outcome that may be retried.
    pub fn is_settled(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }

    /// Whether the graph has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;

        let targets: &[RunStatus] = match self {
            Deactivated => &[Waiting, Aborting, Invalidated],
            Waiting => &[Deactivated, Ready, Aborting, Invalidated],
            Ready => &[Starting, Running, Aborting, Completing],
            Starting => &[Running, Aborting, Completing],
            Running => &[Aborting, Completing],
            Aborting => &[Failed],
            Completing => &[Done],
            Done | Failed => &[Waiting],
            Invalidated => &[],
        };
        targets.contains(&next)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text that does not name a status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status: {0}")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownRunStatus(s.to_string()))
    }
}

/// A stored run row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
    /// Lease deadline used by housekeeping.
    pub lifecycle_suspend_until: DateTime<Utc>,
}

/// Final exit detail of a run's workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunExit {
    pub code: u8,
    pub message: String,
}

/// Data bound to one input of a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Assignment {
    pub input_id: InputId,
    pub knit_id: KnitId,
}

/// A run together with everything attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: RunRecord,
    pub exit: Option<RunExit>,
    pub worker: Option<String>,
    pub inputs: Vec<Assignment>,
    /// Output data, tagged with the full view including `knit#id` and
    /// `knit#timestamp`.
    pub outputs: Vec<DataRecord>,
}
