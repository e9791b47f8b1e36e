use crate::domain::{DataRecord, KnitId, RunId, RunRecord, RunStatus};
use crate::error::LifecycleError;

/// Rows a retry removes, decided before anything is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan {
    /// The run being retried. It survives, its outputs do not.
    pub target: RunId,
    /// Invalidated downstream runs consuming the target's outputs.
    pub runs: Vec<RunId>,
    /// The target's output data.
    pub data: Vec<KnitId>,
}

impl CascadePlan {
    /// Plans the cascade of retrying `target`.
    ///
    /// `downstreams` are the runs consuming any of `outputs`. Any of them not
    /// `Invalidated` blocks the retry.
    pub fn for_retry(
        target: &RunRecord,
        outputs: &[DataRecord],
        downstreams: &[RunRecord],
    ) -> Result<Self, LifecycleError> {
        let live: Vec<RunId> = downstreams
            .iter()
            .filter(|run| run.status != RunStatus::Invalidated)
            .map(|run| run.run_id.clone())
            .collect();
        if !live.is_empty() {
            return Err(LifecycleError::RunHasDownstreams {
                run_id: target.run_id.clone(),
                downstreams: live,
            });
        }

        let mut runs: Vec<RunId> = downstreams.iter().map(|run| run.run_id.clone()).collect();
        runs.sort();
        runs.dedup();

        let mut data: Vec<KnitId> = outputs
            .iter()
            .filter(|d| d.run_id == target.run_id)
            .map(|d| d.knit_id.clone())
            .collect();
        data.sort();
        data.dedup();

        Ok(Self {
            target: target.run_id.clone(),
            runs,
            data,
        })
    }
}
