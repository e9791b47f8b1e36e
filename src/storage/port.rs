//! The storage port the lifecycle and the nomination engine are written against.
//!
//! A [`Store`] opens [`Transaction`]s. Everything done through one transaction
//! becomes visible atomically on [`Transaction::commit`] and is discarded on
//! [`Transaction::rollback`] or when the transaction is dropped. Locks taken
//! through a transaction are held until it ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    Assignment, DataCandidate, DataRecord, InputCriteria, InputId, KnitId, Nomination,
    NominationKey, Plan, PlanId, PseudoPlanName, RunExit, RunId, RunRecord, TagError,
};

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection to the backend failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Another transaction holds a lock this one needs.
    #[error("Lock contention on {relation}: {keys:?}")]
    LockContention { relation: String, keys: Vec<String> },

    /// A stored row cannot be decoded.
    #[error("Corrupted row in {relation}: {message}")]
    Corrupted { relation: String, message: String },

    /// A write referenced a row that does not exist.
    #[error("Dangling reference from {relation}: {message}")]
    Dangling { relation: String, message: String },

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// In-process state became unusable.
    #[error("Storage state poisoned: {0}")]
    Poisoned(String),

    /// A write collided with an existing row.
    #[error("Duplicate row in {relation}: {message}")]
    Duplicate { relation: String, message: String },

    /// A write carried a tag the relation cannot hold.
    #[error("Invalid tag: {0}")]
    InvalidTag(#[from] TagError),
}

impl StorageError {
    pub fn contention(relation: &str, keys: impl IntoIterator<Item = String>) -> Self {
        StorageError::LockContention {
            relation: relation.to_string(),
            keys: keys.into_iter().collect(),
        }
    }

    pub fn corrupted(relation: &str, message: impl Into<String>) -> Self {
        StorageError::Corrupted {
            relation: relation.to_string(),
            message: message.into(),
        }
    }

    pub fn dangling(relation: &str, message: impl Into<String>) -> Self {
        StorageError::Dangling {
            relation: relation.to_string(),
            message: message.into(),
        }
    }

    pub fn duplicate(relation: &str, message: impl Into<String>) -> Self {
        StorageError::Duplicate {
            relation: relation.to_string(),
            message: message.into(),
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, StorageError::LockContention { .. })
    }
}

/// How a row lock behaves when another transaction already holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Return [`StorageError::LockContention`] at once.
    FailOnContention,
    /// Leave the row out and report it in [`Locked::skipped`].
    SkipLocked,
}

/// Outcome of a row lock request. Keys that matched no row appear in neither list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locked<K> {
    pub acquired: Vec<K>,
    pub skipped: Vec<K>,
}

impl<K> Locked<K> {
    pub fn all_acquired(&self) -> bool {
        self.skipped.is_empty()
    }
}

impl<K> Default for Locked<K> {
    fn default() -> Self {
        Self {
            acquired: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Which data items [`Transaction::data_candidates`] returns.
#[derive(Debug, Clone, Copy)]
pub enum DataScope<'a> {
    /// The given knit ids, whatever their run status.
    KnitIds(&'a [KnitId]),
    /// Every item whose producing run is `Done`.
    Done,
}

/// Which inputs [`Transaction::input_criteria`] returns.
#[derive(Debug, Clone, Copy)]
pub enum InputScope<'a> {
    InputIds(&'a [InputId]),
    All,
}

/// Which rows [`Transaction::nominations`] returns.
#[derive(Debug, Clone, Copy)]
pub enum NominationScope<'a> {
    KnitIds(&'a [KnitId]),
    InputIds(&'a [InputId]),
    All,
}

/// Opens transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

/// One unit of atomicity.
#[async_trait]
pub trait Transaction: Send {
    /// Transaction timestamp; constant for the transaction's lifetime.
    async fn now(&mut self) -> Result<DateTime<Utc>, StorageError>;

    // Locks

    async fn lock_runs(
        &mut self,
        run_ids: &[RunId],
        mode: LockMode,
    ) -> Result<Locked<RunId>, StorageError>;

    async fn lock_data(
        &mut self,
        knit_ids: &[KnitId],
        mode: LockMode,
    ) -> Result<Locked<KnitId>, StorageError>;

    /// Exclusive lock on the whole nomination relation. Waits for other holders.
    async fn lock_nominations(&mut self) -> Result<(), StorageError>;

    // Plans

    async fn find_pseudo_plan(
        &mut self,
        name: &PseudoPlanName,
    ) -> Result<Option<Plan>, StorageError>;

    async fn get_plan(&mut self, plan_id: &PlanId) -> Result<Option<Plan>, StorageError>;

    async fn input_criteria(
        &mut self,
        scope: InputScope<'_>,
    ) -> Result<Vec<InputCriteria>, StorageError>;

    // Runs

    async fn get_run(&mut self, run_id: &RunId) -> Result<Option<RunRecord>, StorageError>;

    async fn insert_run(&mut self, run: &RunRecord) -> Result<(), StorageError>;

    /// Writes status, `updated_at` and `lifecycle_suspend_until`.
    async fn update_run(&mut self, run: &RunRecord) -> Result<(), StorageError>;

    /// Deletes runs with their assignments, exit records and workers.
    async fn delete_runs(&mut self, run_ids: &[RunId]) -> Result<(), StorageError>;

    /// Runs with an input assigned to any of the given data.
    async fn downstream_runs(
        &mut self,
        knit_ids: &[KnitId],
    ) -> Result<Vec<RunRecord>, StorageError>;

    async fn assignments(&mut self, run_id: &RunId) -> Result<Vec<Assignment>, StorageError>;

    async fn get_run_exit(&mut self, run_id: &RunId) -> Result<Option<RunExit>, StorageError>;

    async fn upsert_run_exit(&mut self, run_id: &RunId, exit: &RunExit)
        -> Result<(), StorageError>;

    async fn delete_run_exit(&mut self, run_id: &RunId) -> Result<(), StorageError>;

    async fn get_worker(&mut self, run_id: &RunId) -> Result<Option<String>, StorageError>;

    /// Creates the worker row unless one exists.
    async fn upsert_worker(&mut self, run_id: &RunId, name: &str) -> Result<(), StorageError>;

    /// Removes the worker row. Returns whether one existed.
    async fn delete_worker(&mut self, run_id: &RunId) -> Result<bool, StorageError>;

    // Data

    async fn data_of_run(&mut self, run_id: &RunId) -> Result<Vec<DataRecord>, StorageError>;

    /// Inserts a data row with its user tags and timestamp.
    async fn insert_data(&mut self, data: &DataRecord) -> Result<(), StorageError>;

    /// Stamps data that has no timestamp yet.
    async fn set_timestamps(
        &mut self,
        knit_ids: &[KnitId],
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Deletes data rows and records their volumes as garbage.
    async fn discard_data(&mut self, knit_ids: &[KnitId]) -> Result<(), StorageError>;

    async fn data_candidates(
        &mut self,
        scope: DataScope<'_>,
    ) -> Result<Vec<DataCandidate>, StorageError>;

    // Nominations

    async fn nominations(
        &mut self,
        scope: NominationScope<'_>,
    ) -> Result<Vec<Nomination>, StorageError>;

    /// Inserts rows with `updated = true`; existing rows are left alone.
    async fn insert_nominations(&mut self, keys: &[NominationKey]) -> Result<(), StorageError>;

    async fn delete_nominations(&mut self, keys: &[NominationKey]) -> Result<(), StorageError>;

    /// Returns the number of rows deleted.
    async fn delete_nominations_for_data(
        &mut self,
        knit_ids: &[KnitId],
    ) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
