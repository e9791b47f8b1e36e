//! Entities shared by the lifecycle and the nomination engine.

pub mod data;
pub mod nomination;
pub mod plan;
pub mod run;
pub mod tags;

pub use data::{DataCandidate, DataRecord, KnitId};
pub use nomination::{Nomination, NominationKey};
pub use plan::{Input, InputCriteria, InputId, Output, OutputId, Plan, PlanId, PlanKind, PseudoPlanName};
pub use run::{Assignment, RunDetail, RunExit, RunId, RunRecord, RunStatus, UnknownRunStatus};
pub use tags::{Tag, TagError, TagSet};
