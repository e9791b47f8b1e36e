//! Run lifecycle state machine.
//!
//! [`RunLifecycle`] owns the status changes the core is responsible for:
//! finishing a run, recording its exit, creating pseudo runs for externally
//! originated data, and retrying a settled run. Every operation has two forms:
//! one that opens and commits its own transaction, and an `*_in` form that
//! works inside a transaction the caller owns. Any error leaves the
//! transaction to be rolled back, so nothing is ever partially applied.

pub mod cascade;
pub mod naming;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    DataRecord, KnitId, Plan, PseudoPlanName, RunDetail, RunExit, RunId, RunRecord, RunStatus,
};
use crate::error::LifecycleError;
use crate::metrics::MetricsCollector;
use crate::nomination::{MatchingEngine, Nominator};
use crate::storage::{LockMode, StorageError, Store, Transaction};

pub use cascade::CascadePlan;
pub use naming::{NamingConvention, PrefixNamingConvention};

/// A status change applied to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub run_id: RunId,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// What a retry changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub transition: Transition,
    /// Output data destroyed.
    pub deleted_data: Vec<KnitId>,
    /// Invalidated downstream runs destroyed.
    pub deleted_runs: Vec<RunId>,
    /// Fresh output data created in their place.
    pub created_data: Vec<KnitId>,
}

/// Drives runs through the part of their lifecycle the core owns.
pub struct RunLifecycle {
    store: Arc<dyn Store>,
    nominator: Arc<dyn Nominator>,
    naming: Arc<dyn NamingConvention>,
    metrics: MetricsCollector,
}

impl RunLifecycle {
    /// Creates a lifecycle over `store` with the default matching engine
    /// and naming convention.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            nominator: Arc::new(MatchingEngine::new()),
            naming: Arc::new(PrefixNamingConvention::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_nominator(mut self, nominator: Arc<dyn Nominator>) -> Self {
        self.nominator = nominator;
        self
    }

    pub fn with_naming(mut self, naming: Arc<dyn NamingConvention>) -> Self {
        self.naming = naming;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // =========================================================================
    // Self-transacting operations
    // =========================================================================

    /// Moves a `Completing` run to `Done` or an `Aborting` run to `Failed`.
    pub async fn finish(&self, run_id: &RunId) -> Result<Transition, LifecycleError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.finish_in(tx.as_mut(), run_id).await;
        let transition = self.settle("finish", tx, outcome).await?;

        self.metrics.record_transition(transition.from, transition.to);
        tracing::info!(
            run_id = %transition.run_id,
            from = %transition.from,
            to = %transition.to,
            "run finished"
        );
        Ok(transition)
    }

    /// Records the exit detail of a run, replacing any earlier one.
    pub async fn set_exit(&self, run_id: &RunId, exit: &RunExit) -> Result<(), LifecycleError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.set_exit_in(tx.as_mut(), run_id, exit).await;
        self.settle("set_exit", tx, outcome).await?;

        tracing::info!(run_id = %run_id, code = exit.code, "run exit recorded");
        Ok(())
    }

    /// Creates a `Running` run of a pseudo plan together with its output data.
    pub async fn new_pseudo(
        &self,
        plan_name: &PseudoPlanName,
        lifecycle_suspend: Duration,
    ) -> Result<RunId, LifecycleError> {
        let mut tx = self.store.begin().await?;
        let outcome = self
            .new_pseudo_in(tx.as_mut(), plan_name, lifecycle_suspend)
            .await;
        let run_id = self.settle("new_pseudo", tx, outcome).await?;

        tracing::info!(run_id = %run_id, plan = %plan_name, "pseudo run created");
        Ok(run_id)
    }

    /// Sends a `Done` or `Failed` run back to `Waiting`, destroying its outputs.
    pub async fn retry(&self, run_id: &RunId) -> Result<RetryOutcome, LifecycleError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.retry_in(tx.as_mut(), run_id).await;
        let retried = self.settle("retry", tx, outcome).await?;

        self.metrics
            .record_transition(retried.transition.from, retried.transition.to);
        self.metrics
            .record_cascade(retried.deleted_runs.len(), retried.deleted_data.len());
        tracing::info!(
            run_id = %run_id,
            from = %retried.transition.from,
            deleted_data = retried.deleted_data.len(),
            deleted_runs = retried.deleted_runs.len(),
            "run retried"
        );
        Ok(retried)
    }

    /// Forgets the worker of a run once its workload is gone.
    ///
    /// Retry refuses runs that still have a worker. Returns whether one existed.
    pub async fn delete_worker(&self, run_id: &RunId) -> Result<bool, LifecycleError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.delete_worker_in(tx.as_mut(), run_id).await;
        let existed = self.settle("delete_worker", tx, outcome).await?;

        tracing::info!(run_id = %run_id, existed, "run worker deleted");
        Ok(existed)
    }

    /// Loads a run with its exit, worker, assignments and outputs.
    ///
    /// Output tags are the full view, reserved tags included.
    pub async fn get(&self, run_id: &RunId) -> Result<RunDetail, LifecycleError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.get_in(tx.as_mut(), run_id).await;
        self.settle("get", tx, outcome).await
    }

    async fn settle<T>(
        &self,
        operation: &'static str,
        tx: Box<dyn Transaction>,
        outcome: Result<T, LifecycleError>,
    ) -> Result<T, LifecycleError> {
        let result = match outcome {
            Ok(value) => tx.commit().await.map(|_| value).map_err(LifecycleError::from),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(operation, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        };

        if let Err(e) = &result {
            self.metrics.record_operation_error(operation, e.kind());
            tracing::warn!(operation, kind = e.kind().as_str(), error = %e, "run operation failed");
        }
        result
    }

    // =========================================================================
    // Operations within a caller's transaction
    // =========================================================================

    /// [`finish`](Self::finish) inside `tx`.
    ///
    /// Runs in any status other than `Aborting` are reported as an invalid
    /// change towards `Done`. The run's input data is locked as well, so an
    /// upstream retry cannot sweep it meanwhile.
    pub async fn finish_in(
        &self,
        tx: &mut dyn Transaction,
        run_id: &RunId,
    ) -> Result<Transition, LifecycleError> {
        tx.lock_runs(std::slice::from_ref(run_id), LockMode::FailOnContention)
            .await?;
        let mut run = tx
            .get_run(run_id)
            .await?
            .ok_or_else(|| LifecycleError::missing_run(run_id))?;

        let from = run.status;
        let Some(to) = from.finish_target() else {
            return Err(LifecycleError::InvalidRunStateChanging {
                run_id: run_id.clone(),
                from,
                to: RunStatus::Done,
            });
        };
        ensure_transition(&run, to)?;

        let inputs: Vec<KnitId> = tx
            .assignments(run_id)
            .await?
            .into_iter()
            .map(|a| a.knit_id)
            .collect();
        tx.lock_data(&inputs, LockMode::FailOnContention).await?;

        let now = tx.now().await?;
        let outputs = knit_ids_of(&tx.data_of_run(run_id).await?);
        tx.set_timestamps(&outputs, now).await?;

        run.status = to;
        run.updated_at = now;
        run.lifecycle_suspend_until = now;
        tx.update_run(&run).await?;

        if to == RunStatus::Done {
            self.nominator.nominate_data(tx, &outputs).await?;
        }

        Ok(Transition {
            run_id: run_id.clone(),
            from,
            to,
        })
    }

    /// [`set_exit`](Self::set_exit) inside `tx`.
    pub async fn set_exit_in(
        &self,
        tx: &mut dyn Transaction,
        run_id: &RunId,
        exit: &RunExit,
    ) -> Result<(), LifecycleError> {
        if tx.get_run(run_id).await?.is_none() {
            return Err(LifecycleError::missing_run(run_id));
        }
        tx.upsert_run_exit(run_id, exit).await?;
        Ok(())
    }

    /// [`new_pseudo`](Self::new_pseudo) inside `tx`.
    pub async fn new_pseudo_in(
        &self,
        tx: &mut dyn Transaction,
        plan_name: &PseudoPlanName,
        lifecycle_suspend: Duration,
    ) -> Result<RunId, LifecycleError> {
        let plan = tx
            .find_pseudo_plan(plan_name)
            .await?
            .ok_or_else(|| LifecycleError::Missing {
                entity: "pseudo plan",
                id: plan_name.to_string(),
            })?;
        if plan.outputs.len() != 1 {
            return Err(StorageError::corrupted(
                "output",
                format!(
                    "pseudo plan {} has {} outputs",
                    plan.plan_id,
                    plan.outputs.len()
                ),
            )
            .into());
        }

        let run_id = RunId::generate();
        let outputs = self.fresh_outputs(&plan, &run_id)?;

        let now = tx.now().await?;
        tx.insert_run(&RunRecord {
            run_id: run_id.clone(),
            plan_id: plan.plan_id.clone(),
            status: RunStatus::Running,
            updated_at: now,
            lifecycle_suspend_until: suspend_until(now, lifecycle_suspend),
        })
        .await?;
        for output in &outputs {
            tx.insert_data(output).await?;
        }

        Ok(run_id)
    }

    /// [`retry`](Self::retry) inside `tx`.
    pub async fn retry_in(
        &self,
        tx: &mut dyn Transaction,
        run_id: &RunId,
    ) -> Result<RetryOutcome, LifecycleError> {
        tx.lock_runs(std::slice::from_ref(run_id), LockMode::FailOnContention)
            .await?;
        let mut run = tx
            .get_run(run_id)
            .await?
            .ok_or_else(|| LifecycleError::missing_run(run_id))?;
        let plan = tx
            .get_plan(&run.plan_id)
            .await?
            .ok_or_else(|| LifecycleError::Missing {
                entity: "plan",
                id: run.plan_id.to_string(),
            })?;

        if let Some(name) = plan.pseudo_name() {
            return Err(LifecycleError::RunIsProtected {
                run_id: run_id.clone(),
                reason: format!("runs of pseudo plan {} cannot be retried", name),
            });
        }
        // Invalidated runs are treated as deleted.
        if run.status == RunStatus::Invalidated {
            return Err(LifecycleError::missing_run(run_id));
        }
        if !run.status.is_settled() {
            return Err(LifecycleError::InvalidRunStateChanging {
                run_id: run_id.clone(),
                from: run.status,
                to: RunStatus::Waiting,
            });
        }
        ensure_transition(&run, RunStatus::Waiting)?;
        if let Some(worker) = tx.get_worker(run_id).await? {
            return Err(LifecycleError::WorkerActive {
                run_id: run_id.clone(),
                worker,
            });
        }

        let outputs = tx.data_of_run(run_id).await?;
        let downstreams = tx.downstream_runs(&knit_ids_of(&outputs)).await?;
        let cascade = CascadePlan::for_retry(&run, &outputs, &downstreams)?;

        let locked = tx.lock_data(&cascade.data, LockMode::SkipLocked).await?;
        reject_skipped("data", &locked.skipped)?;
        let locked = tx.lock_runs(&cascade.runs, LockMode::SkipLocked).await?;
        reject_skipped("run", &locked.skipped)?;

        self.apply_cascade(tx, &cascade).await?;

        let fresh = self.fresh_outputs(&plan, run_id)?;
        for output in &fresh {
            tx.insert_data(output).await?;
        }
        tx.upsert_worker(run_id, &self.naming.worker(run_id)?)
            .await?;

        let now = tx.now().await?;
        let from = run.status;
        run.status = RunStatus::Waiting;
        run.updated_at = now;
        run.lifecycle_suspend_until = now;
        tx.update_run(&run).await?;

        Ok(RetryOutcome {
            transition: Transition {
                run_id: run_id.clone(),
                from,
                to: RunStatus::Waiting,
            },
            deleted_data: cascade.data,
            deleted_runs: cascade.runs,
            created_data: knit_ids_of(&fresh),
        })
    }

    /// [`get`](Self::get) inside `tx`.
    pub async fn get_in(
        &self,
        tx: &mut dyn Transaction,
        run_id: &RunId,
    ) -> Result<RunDetail, LifecycleError> {
        let run = tx
            .get_run(run_id)
            .await?
            .ok_or_else(|| LifecycleError::missing_run(run_id))?;

        let outputs = tx
            .data_of_run(run_id)
            .await?
            .into_iter()
            .map(|mut output| {
                output.tags = output.full_tags();
                output
            })
            .collect();

        Ok(RunDetail {
            exit: tx.get_run_exit(run_id).await?,
            worker: tx.get_worker(run_id).await?,
            inputs: tx.assignments(run_id).await?,
            outputs,
            run,
        })
    }

    /// [`delete_worker`](Self::delete_worker) inside `tx`.
    pub async fn delete_worker_in(
        &self,
        tx: &mut dyn Transaction,
        run_id: &RunId,
    ) -> Result<bool, LifecycleError> {
        if tx.get_run(run_id).await?.is_none() {
            return Err(LifecycleError::missing_run(run_id));
        }
        Ok(tx.delete_worker(run_id).await?)
    }

    async fn apply_cascade(
        &self,
        tx: &mut dyn Transaction,
        cascade: &CascadePlan,
    ) -> Result<(), LifecycleError> {
        tracing::debug!(
            run_id = %cascade.target,
            runs = ?cascade.runs,
            data = ?cascade.data,
            "applying retry cascade"
        );

        tx.delete_runs(&cascade.runs).await?;
        tx.delete_run_exit(&cascade.target).await?;
        self.nominator.drop_data(tx, &cascade.data).await?;
        tx.discard_data(&cascade.data).await?;
        Ok(())
    }

    /// One new data row per output of `plan`, bound to `run_id`.
    fn fresh_outputs(&self, plan: &Plan, run_id: &RunId) -> Result<Vec<DataRecord>, LifecycleError> {
        plan.outputs
            .iter()
            .map(|output| {
                let knit_id = KnitId::generate();
                Ok(DataRecord {
                    volume_ref: self.naming.volume_ref(&knit_id)?,
                    knit_id,
                    run_id: run_id.clone(),
                    output_id: output.output_id,
                    plan_id: plan.plan_id.clone(),
                    tags: output.tags.user(),
                    timestamp: None,
                })
            })
            .collect()
    }
}

fn ensure_transition(run: &RunRecord, to: RunStatus) -> Result<(), LifecycleError> {
    if run.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidRunStateChanging {
            run_id: run.run_id.clone(),
            from: run.status,
            to,
        })
    }
}

fn reject_skipped<K: ToString>(relation: &str, skipped: &[K]) -> Result<(), LifecycleError> {
    if skipped.is_empty() {
        return Ok(());
    }
    tracing::warn!(relation, skipped = skipped.len(), "cascade rows locked elsewhere");
    Err(StorageError::contention(relation, skipped.iter().map(ToString::to_string)).into())
}

fn knit_ids_of(records: &[DataRecord]) -> Vec<KnitId> {
    records.iter().map(|d| d.knit_id.clone()).collect()
}

fn suspend_until(now: DateTime<Utc>, suspend: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(suspend)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_suspend_until_saturates() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            suspend_until(now, Duration::from_secs(90)),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap()
        );
        assert_eq!(suspend_until(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_reject_skipped_reports_contention() {
        assert!(reject_skipped::<RunId>("run", &[]).is_ok());

        let err = reject_skipped("run", &[RunId::from("r9")]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LockContention);
    }
}
