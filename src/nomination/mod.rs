//! Nomination matching engine.
//!
//! Maintains the relation between data items and the inputs they currently
//! satisfy. Two reconciliation passes exist, one starting from data and one
//! starting from inputs; both evaluate the same predicate and differ only in
//! which slice of the relation they load and rewrite.
//!
//! Every pass first takes the exclusive nomination lock of the caller's
//! transaction, so concurrent passes serialize and each one reconciles
//! against a stable snapshot.

mod predicate;
pub mod reconcile;

use std::time::Instant;

use async_trait::async_trait;

use crate::domain::{InputId, KnitId, Nomination};
use crate::error::NominationError;
use crate::metrics::MetricsCollector;
use crate::storage::{DataScope, InputScope, NominationScope, Transaction};

pub use reconcile::{desired, reconcile, NominationDiff};

/// The nomination engine as seen by the run lifecycle.
///
/// All methods work inside the caller's open transaction and leave commit
/// or rollback to the caller.
#[async_trait]
pub trait Nominator: Send + Sync {
    /// Reconciles the nominations of the given data items.
    async fn nominate_data(
        &self,
        tx: &mut dyn Transaction,
        knit_ids: &[KnitId],
    ) -> Result<(), NominationError>;

    /// Reconciles the nominations of the given inputs against all data.
    async fn nominate_mountpoints(
        &self,
        tx: &mut dyn Transaction,
        input_ids: &[InputId],
    ) -> Result<(), NominationError>;

    /// Deletes every nomination of the given data items.
    async fn drop_data(
        &self,
        tx: &mut dyn Transaction,
        knit_ids: &[KnitId],
    ) -> Result<(), NominationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Data,
    Inputs,
    Drop,
}

impl Pass {
    fn as_str(self) -> &'static str {
        match self {
            Pass::Data => "data",
            Pass::Inputs => "inputs",
            Pass::Drop => "drop",
        }
    }
}

/// Storage-backed [`Nominator`].
#[derive(Debug, Clone, Default)]
pub struct MatchingEngine {
    metrics: MetricsCollector,
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        pass: Pass,
        diff: NominationDiff,
        started: Instant,
    ) -> Result<(), NominationError> {
        if !diff.delete.is_empty() {
            tx.delete_nominations(&diff.delete).await?;
        }
        if !diff.insert.is_empty() {
            tx.insert_nominations(&diff.insert).await?;
        }

        tracing::debug!(
            pass = pass.as_str(),
            inserted = diff.insert.len(),
            deleted = diff.delete.len(),
            "reconciled nominations"
        );
        self.metrics.record_nomination_pass(
            pass.as_str(),
            diff.insert.len(),
            diff.delete.len(),
            started.elapsed().as_secs_f64(),
        );
        Ok(())
    }

    /// Lists nominations within a transaction, for inspection.
    pub async fn list(
        &self,
        tx: &mut dyn Transaction,
        scope: NominationScope<'_>,
    ) -> Result<Vec<Nomination>, NominationError> {
        Ok(tx.nominations(scope).await?)
    }
}

#[async_trait]
impl Nominator for MatchingEngine {
    async fn nominate_data(
        &self,
        tx: &mut dyn Transaction,
        knit_ids: &[KnitId],
    ) -> Result<(), NominationError> {
        let started = Instant::now();
        tx.lock_nominations().await?;
        if knit_ids.is_empty() {
            return Ok(());
        }

        let inputs = tx.input_criteria(InputScope::All).await?;
        let candidates = tx.data_candidates(DataScope::KnitIds(knit_ids)).await?;
        let existing = tx.nominations(NominationScope::KnitIds(knit_ids)).await?;

        let diff = reconcile(&desired(&inputs, &candidates), &existing);
        self.apply(tx, Pass::Data, diff, started).await
    }

    async fn nominate_mountpoints(
        &self,
        tx: &mut dyn Transaction,
        input_ids: &[InputId],
    ) -> Result<(), NominationError> {
        let started = Instant::now();
        tx.lock_nominations().await?;
        if input_ids.is_empty() {
            return Ok(());
        }

        let inputs = tx.input_criteria(InputScope::InputIds(input_ids)).await?;
        let candidates = tx.data_candidates(DataScope::Done).await?;
        let existing = tx.nominations(NominationScope::InputIds(input_ids)).await?;

        let diff = reconcile(&desired(&inputs, &candidates), &existing);
        self.apply(tx, Pass::Inputs, diff, started).await
    }

    async fn drop_data(
        &self,
        tx: &mut dyn Transaction,
        knit_ids: &[KnitId],
    ) -> Result<(), NominationError> {
        let started = Instant::now();
        tx.lock_nominations().await?;
        if knit_ids.is_empty() {
            return Ok(());
        }

        let deleted = tx.delete_nominations_for_data(knit_ids).await?;
        tracing::debug!(
            pass = Pass::Drop.as_str(),
            deleted = deleted,
            "dropped nominations"
        );
        self.metrics.record_nomination_pass(
            Pass::Drop.as_str(),
            0,
            deleted as usize,
            started.elapsed().as_secs_f64(),
        );
        Ok(())
    }
}
