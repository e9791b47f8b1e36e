//! Error types for knitcore.
//!
//! Each subsystem has its own error enum. [`ErrorKind`] classifies all of
//! them into the categories callers branch on.

use thiserror::Error;

use crate::domain::{RunId, RunStatus};
use crate::storage::StorageError;

/// Category of a failure, independent of the subsystem that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced run, plan or data item does not exist.
    Missing,
    /// The run's status does not permit the operation.
    InvalidState,
    /// The run belongs to a pseudo plan.
    Protected,
    /// A worker may still read or write the run's data.
    WorkerActive,
    /// Output data is consumed by a live downstream run.
    DownstreamConflict,
    /// Another transaction holds a needed lock.
    LockContention,
    /// A naming or nominator collaborator failed.
    Collaborator,
    /// Any other storage failure.
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Missing => "missing",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Protected => "protected",
            ErrorKind::WorkerActive => "worker_active",
            ErrorKind::DownstreamConflict => "downstream_conflict",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::Collaborator => "collaborator",
            ErrorKind::Storage => "storage",
        }
    }

    fn of_storage(err: &StorageError) -> Self {
        if err.is_lock_contention() {
            ErrorKind::LockContention
        } else {
            ErrorKind::Storage
        }
    }
}

/// Errors raised by a naming convention.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    /// The derived name is not a valid object name.
    #[error("cannot name '{subject}': {reason}")]
    Rejected { subject: String, reason: String },
}

/// Errors raised by the nomination engine.
#[derive(Debug, Error)]
pub enum NominationError {
    #[error("nomination storage failure: {0}")]
    Storage(#[from] StorageError),

    /// A nominator implementation refused the request.
    #[error("nominator failed: {0}")]
    Failed(String),
}

impl NominationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NominationError::Storage(e) => ErrorKind::of_storage(e),
            NominationError::Failed(_) => ErrorKind::Collaborator,
        }
    }
}

/// Errors raised by run lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("missing {entity}: {id}")]
    Missing { entity: &'static str, id: String },

    #[error("invalid run state changing for run {run_id}: {from} -> {to}")]
    InvalidRunStateChanging {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {run_id} is protected: {reason}")]
    RunIsProtected { run_id: RunId, reason: String },

    #[error("run {run_id} is possibly running: worker {worker} still exists")]
    WorkerActive { run_id: RunId, worker: String },

    #[error("run {run_id} has downstreams: {downstreams:?}")]
    RunHasDownstreams {
        run_id: RunId,
        downstreams: Vec<RunId>,
    },

    #[error("naming failed: {0}")]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Nomination(#[from] NominationError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl LifecycleError {
    pub fn missing_run(run_id: &RunId) -> Self {
        LifecycleError::Missing {
            entity: "run",
            id: run_id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Missing { .. } => ErrorKind::Missing,
            LifecycleError::InvalidRunStateChanging { .. } => ErrorKind::InvalidState,
            LifecycleError::RunIsProtected { .. } => ErrorKind::Protected,
            LifecycleError::WorkerActive { .. } => ErrorKind::WorkerActive,
            LifecycleError::RunHasDownstreams { .. } => ErrorKind::DownstreamConflict,
            LifecycleError::Naming(_) => ErrorKind::Collaborator,
            LifecycleError::Nomination(e) => e.kind(),
            LifecycleError::Storage(e) => ErrorKind::of_storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_is_classified_through_every_layer() {
        let direct = LifecycleError::from(StorageError::contention("run", ["r1".to_string()]));
        assert_eq!(direct.kind(), ErrorKind::LockContention);

        let nested = LifecycleError::from(NominationError::from(StorageError::contention(
            "nomination",
            Vec::new(),
        )));
        assert_eq!(nested.kind(), ErrorKind::LockContention);
    }

    #[test]
    fn test_collaborator_errors() {
        let naming = LifecycleError::from(NamingError::Rejected {
            subject: "k1".to_string(),
            reason: "too long".to_string(),
        });
        assert_eq!(naming.kind(), ErrorKind::Collaborator);

        let nominator = LifecycleError::from(NominationError::Failed("boom".to_string()));
        assert_eq!(nominator.kind(), ErrorKind::Collaborator);
        assert_eq!(nominator.to_string(), "nominator failed: boom");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = LifecycleError::InvalidRunStateChanging {
            run_id: RunId::from("r1"),
            from: RunStatus::Running,
            to: RunStatus::Done,
        };
        assert_eq!(
            err.to_string(),
            "invalid run state changing for run r1: running -> done"
        );
        assert_eq!(err.kind().as_str(), "invalid_state");
    }
}
