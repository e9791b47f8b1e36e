//! Integration tests for the run lifecycle against the memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use common::*;
use knitcore::domain::{
    InputId, KnitId, Nomination, PseudoPlanName, RunExit, RunId, RunStatus, Tag,
};
use knitcore::error::{ErrorKind, LifecycleError, NamingError};
use knitcore::lifecycle::{NamingConvention, RunLifecycle};
use knitcore::storage::{LockMode, MemoryStore, Transaction};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

struct Fixture {
    store: MemoryStore,
    nominator: Arc<RecordingNominator>,
    lifecycle: RunLifecycle,
}

impl Fixture {
    fn with_nominator(nominator: Arc<RecordingNominator>) -> Self {
        let store = MemoryStore::new();
        let lifecycle =
            RunLifecycle::new(Arc::new(store.clone())).with_nominator(nominator.clone());
        Self {
            store,
            nominator,
            lifecycle,
        }
    }

    fn new() -> Self {
        Self::with_nominator(RecordingNominator::new())
    }

    /// Upstream image plan (output 10) feeding a consumer plan (input 1,
    /// output 20), plus the uploaded pseudo plan (output 90).
    fn with_plans(self) -> Self {
        self.store
            .add_plan(image_plan("upstream", Vec::new(), vec![output(10)]))
            .unwrap();
        self.store
            .add_plan(image_plan(
                "consumer",
                vec![input(1, tags(&[("type", "csv")]))],
                vec![output(20)],
            ))
            .unwrap();
        self.store.add_plan(uploaded_plan("uploaded", 90)).unwrap();
        self
    }

    /// Adds a run of `plan` with one output data item `knit`.
    fn add_run_with_output(&self, id: &str, plan: &str, status: RunStatus, knit: &str) {
        let output_id = match plan {
            "upstream" => 10,
            "consumer" => 20,
            _ => 90,
        };
        let record = run(id, plan, status, t0());
        self.store.add_run(record.clone()).unwrap();
        self.store
            .add_data(data(knit, &record, output_id, tags(&[("type", "csv")])))
            .unwrap();
    }

    /// Adds a consumer run reading `knit` through input 1.
    fn add_downstream(&self, id: &str, status: RunStatus, knit: &str) {
        self.store.add_run(run(id, "consumer", status, t0())).unwrap();
        self.store
            .add_assignment(&RunId::from(id), InputId(1), &KnitId::from(knit))
            .unwrap();
    }
}

fn expect_kind<T: std::fmt::Debug>(result: Result<T, LifecycleError>, kind: ErrorKind) {
    match result {
        Ok(value) => panic!("expected {:?}, got Ok({:?})", kind, value),
        Err(e) => assert_eq!(e.kind(), kind, "unexpected error: {}", e),
    }
}

// ============================================================================
// Finish
// ============================================================================

#[tokio::test]
async fn test_finish_completing_run_nominates_its_outputs() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Completing, "k-1");

    let transition = fx.lifecycle.finish(&RunId::from("r-1")).await.unwrap();
    assert_eq!(transition.from, RunStatus::Completing);
    assert_eq!(transition.to, RunStatus::Done);

    assert_eq!(
        fx.nominator.calls(),
        vec![Call::NominateData(knit_ids(&["k-1"]))]
    );

    let snapshot = fx.store.snapshot().unwrap();
    let finished = &snapshot.runs[&RunId::from("r-1")];
    assert_eq!(finished.status, RunStatus::Done);
    assert_eq!(finished.updated_at, finished.lifecycle_suspend_until);
    assert!(snapshot.data[&KnitId::from("k-1")].timestamp.is_some());
    assert_eq!(
        snapshot.nominations,
        vec![Nomination {
            input_id: InputId(1),
            knit_id: KnitId::from("k-1"),
            updated: true,
        }]
    );
}

#[tokio::test]
async fn test_finish_aborting_run_fails_without_nomination() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Aborting, "k-1");

    let transition = fx.lifecycle.finish(&RunId::from("r-1")).await.unwrap();
    assert_eq!(transition.to, RunStatus::Failed);
    assert!(fx.nominator.calls().is_empty());

    let snapshot = fx.store.snapshot().unwrap();
    assert_eq!(snapshot.runs[&RunId::from("r-1")].status, RunStatus::Failed);
    assert!(snapshot.nominations.is_empty());
}

#[tokio::test]
async fn test_finish_from_other_states_changes_nothing() {
    for status in RunStatus::ALL {
        if matches!(status, RunStatus::Completing | RunStatus::Aborting) {
            continue;
        }
        let fx = Fixture::new().with_plans();
        fx.add_run_with_output("r-1", "upstream", status, "k-1");
        let before = fx.store.snapshot().unwrap();

        let result = fx.lifecycle.finish(&RunId::from("r-1")).await;
        expect_kind(result, ErrorKind::InvalidState);

        assert_eq!(fx.store.snapshot().unwrap(), before, "status {}", status);
        assert!(fx.nominator.calls().is_empty());
    }
}

#[tokio::test]
async fn test_finish_unknown_run_is_missing() {
    let fx = Fixture::new().with_plans();
    expect_kind(
        fx.lifecycle.finish(&RunId::from("nope")).await,
        ErrorKind::Missing,
    );
}

#[tokio::test]
async fn test_finish_fails_fast_on_a_locked_run() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Completing, "k-1");

    let mut holder = fx.store.begin_memory();
    holder
        .lock_runs(&[RunId::from("r-1")], LockMode::FailOnContention)
        .await
        .unwrap();

    expect_kind(
        fx.lifecycle.finish(&RunId::from("r-1")).await,
        ErrorKind::LockContention,
    );
    expect_kind(
        fx.lifecycle.retry(&RunId::from("r-1")).await,
        ErrorKind::LockContention,
    );

    Box::new(holder).rollback().await.unwrap();
    assert!(fx.lifecycle.finish(&RunId::from("r-1")).await.is_ok());
}

#[tokio::test]
async fn test_finish_fails_fast_on_locked_input_data() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-up", "upstream", RunStatus::Done, "k-1");
    fx.add_downstream("r-down", RunStatus::Completing, "k-1");
    let before = fx.store.snapshot().unwrap();

    let mut holder = fx.store.begin_memory();
    holder
        .lock_data(&knit_ids(&["k-1"]), LockMode::FailOnContention)
        .await
        .unwrap();

    expect_kind(
        fx.lifecycle.finish(&RunId::from("r-down")).await,
        ErrorKind::LockContention,
    );
    assert_eq!(fx.store.snapshot().unwrap(), before);

    drop(holder);
    let transition = fx.lifecycle.finish(&RunId::from("r-down")).await.unwrap();
    assert_eq!(transition.to, RunStatus::Done);
}

#[tokio::test]
async fn test_get_reports_full_output_tags() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Completing, "k-1");
    let run_id = RunId::from("r-1");

    let before = fx.lifecycle.get(&run_id).await.unwrap();
    let tags = &before.outputs[0].tags;
    assert!(tags.contains(&Tag::new("type", "csv")));
    assert!(tags.contains(&Tag::knit_id("k-1")));
    assert_eq!(tags.len(), 2);

    fx.lifecycle.finish(&run_id).await.unwrap();

    let after = fx.lifecycle.get(&run_id).await.unwrap();
    let output = &after.outputs[0];
    let stamped = output.timestamp.expect("finish stamps outputs");
    assert!(output.tags.contains(&Tag::knit_id("k-1")));
    assert!(output.tags.contains(&Tag::timestamp(stamped)));
    assert!(output.tags.contains(&Tag::new("type", "csv")));

    let stored = fx.store.snapshot().unwrap();
    assert_eq!(stored.data[&KnitId::from("k-1")].tags.len(), 1);
}

// ============================================================================
// SetExit
// ============================================================================

#[tokio::test]
async fn test_set_exit_overwrites() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Running, "k-1");
    let run_id = RunId::from("r-1");

    let first = RunExit {
        code: 1,
        message: "Error".to_string(),
    };
    let second = RunExit {
        code: 0,
        message: "Completed".to_string(),
    };
    fx.lifecycle.set_exit(&run_id, &first).await.unwrap();
    fx.lifecycle.set_exit(&run_id, &second).await.unwrap();

    let detail = fx.lifecycle.get(&run_id).await.unwrap();
    assert_eq!(detail.exit, Some(second));
    assert_eq!(detail.run.status, RunStatus::Running);
}

#[tokio::test]
async fn test_set_exit_unknown_run_is_missing() {
    let fx = Fixture::new().with_plans();
    let exit = RunExit {
        code: 0,
        message: String::new(),
    };
    expect_kind(
        fx.lifecycle.set_exit(&RunId::from("nope"), &exit).await,
        ErrorKind::Missing,
    );
}

// ============================================================================
// NewPseudo
// ============================================================================

#[tokio::test]
async fn test_new_pseudo_creates_running_run_with_one_output() {
    let fx = Fixture::new().with_plans();

    let run_id = fx
        .lifecycle
        .new_pseudo(&PseudoPlanName::uploaded(), Duration::from_secs(300))
        .await
        .unwrap();

    let detail = fx.lifecycle.get(&run_id).await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Running);
    assert_eq!(
        detail.run.lifecycle_suspend_until - detail.run.updated_at,
        chrono::Duration::seconds(300)
    );
    assert_eq!(detail.outputs.len(), 1);

    let output = &detail.outputs[0];
    assert_eq!(output.run_id, run_id);
    assert_eq!(output.output_id.0, 90);
    assert_eq!(
        output.volume_ref,
        format!("data-knitid-{}", output.knit_id)
    );
    assert!(output.timestamp.is_none());
}

#[tokio::test]
async fn test_new_pseudo_unknown_plan_is_missing() {
    let fx = Fixture::new();
    let name = PseudoPlanName::new("knit#imported").unwrap();
    expect_kind(
        fx.lifecycle.new_pseudo(&name, Duration::ZERO).await,
        ErrorKind::Missing,
    );
}

struct RefusingNaming;

impl NamingConvention for RefusingNaming {
    fn volume_ref(&self, knit_id: &KnitId) -> Result<String, NamingError> {
        Err(NamingError::Rejected {
            subject: knit_id.to_string(),
            reason: "no volumes today".to_string(),
        })
    }

    fn worker(&self, run_id: &RunId) -> Result<String, NamingError> {
        Err(NamingError::Rejected {
            subject: run_id.to_string(),
            reason: "no workers today".to_string(),
        })
    }
}

#[tokio::test]
async fn test_new_pseudo_naming_error_leaves_no_trace() {
    let fx = Fixture::new().with_plans();
    let lifecycle =
        RunLifecycle::new(Arc::new(fx.store.clone())).with_naming(Arc::new(RefusingNaming));
    let before = fx.store.snapshot().unwrap();

    expect_kind(
        lifecycle
            .new_pseudo(&PseudoPlanName::uploaded(), Duration::ZERO)
            .await,
        ErrorKind::Collaborator,
    );
    assert_eq!(fx.store.snapshot().unwrap(), before);
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_retry_pseudo_run_is_protected_in_every_status() {
    for status in RunStatus::ALL {
        let fx = Fixture::new().with_plans();
        fx.add_run_with_output("r-up", "uploaded", status, "k-1");

        expect_kind(
            fx.lifecycle.retry(&RunId::from("r-up")).await,
            ErrorKind::Protected,
        );
    }
}

#[tokio::test]
async fn test_retry_unsettled_run_is_invalid() {
    for status in RunStatus::ALL {
        if matches!(
            status,
            RunStatus::Done | RunStatus::Failed | RunStatus::Invalidated
        ) {
            continue;
        }
        let fx = Fixture::new().with_plans();
        fx.add_run_with_output("r-1", "upstream", status, "k-1");

        expect_kind(
            fx.lifecycle.retry(&RunId::from("r-1")).await,
            ErrorKind::InvalidState,
        );
    }
}

#[tokio::test]
async fn test_retry_unknown_or_invalidated_run_is_missing() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Invalidated, "k-1");

    expect_kind(
        fx.lifecycle.retry(&RunId::from("nope")).await,
        ErrorKind::Missing,
    );
    expect_kind(
        fx.lifecycle.retry(&RunId::from("r-1")).await,
        ErrorKind::Missing,
    );
}

#[tokio::test]
async fn test_retry_with_live_downstream_changes_nothing() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Done, "k-1");
    fx.store
        .add_run_exit(
            &RunId::from("r-1"),
            RunExit {
                code: 0,
                message: "Completed".to_string(),
            },
        )
        .unwrap();
    fx.add_downstream("r-down", RunStatus::Running, "k-1");
    let before = fx.store.snapshot().unwrap();

    let err = fx.lifecycle.retry(&RunId::from("r-1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DownstreamConflict);
    match err {
        LifecycleError::RunHasDownstreams { downstreams, .. } => {
            assert_eq!(downstreams, vec![RunId::from("r-down")]);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(fx.store.snapshot().unwrap(), before);
    assert!(fx.nominator.calls().is_empty());
}

#[tokio::test]
async fn test_retry_sweeps_invalidated_downstream() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Done, "k-1");
    fx.store
        .add_run_exit(
            &RunId::from("r-1"),
            RunExit {
                code: 0,
                message: "Completed".to_string(),
            },
        )
        .unwrap();
    fx.store
        .add_nomination(Nomination {
            input_id: InputId(1),
            knit_id: KnitId::from("k-1"),
            updated: false,
        })
        .unwrap();
    fx.add_downstream("r-down", RunStatus::Invalidated, "k-1");

    let outcome = fx.lifecycle.retry(&RunId::from("r-1")).await.unwrap();
    assert_eq!(outcome.transition.from, RunStatus::Done);
    assert_eq!(outcome.transition.to, RunStatus::Waiting);
    assert_eq!(outcome.deleted_runs, vec![RunId::from("r-down")]);
    assert_eq!(outcome.deleted_data, knit_ids(&["k-1"]));
    assert_eq!(outcome.created_data.len(), 1);

    assert_eq!(fx.nominator.calls(), vec![Call::DropData(knit_ids(&["k-1"]))]);

    let snapshot = fx.store.snapshot().unwrap();
    let retried = &snapshot.runs[&RunId::from("r-1")];
    assert_eq!(retried.status, RunStatus::Waiting);
    assert_eq!(retried.updated_at, retried.lifecycle_suspend_until);
    assert!(!snapshot.runs.contains_key(&RunId::from("r-down")));
    assert!(!snapshot.run_exits.contains_key(&RunId::from("r-1")));
    assert!(!snapshot.data.contains_key(&KnitId::from("k-1")));
    assert!(snapshot.assignments.is_empty());
    assert!(snapshot.nominations.is_empty());
    assert_eq!(
        snapshot.garbage.get(&KnitId::from("k-1")).map(String::as_str),
        Some("vol-k-1")
    );
    assert_eq!(
        snapshot.workers.get(&RunId::from("r-1")).map(String::as_str),
        Some("worker-run-r-1")
    );

    let fresh = snapshot.data_of_run(&RunId::from("r-1"));
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].knit_id, outcome.created_data[0]);
    assert!(fresh[0].timestamp.is_none());
}

#[tokio::test]
async fn test_retry_failed_run_without_downstream() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Failed, "k-1");

    let outcome = fx.lifecycle.retry(&RunId::from("r-1")).await.unwrap();
    assert_eq!(outcome.transition.from, RunStatus::Failed);
    assert!(outcome.deleted_runs.is_empty());

    let detail = fx.lifecycle.get(&RunId::from("r-1")).await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Waiting);
    assert_eq!(detail.exit, None);
    assert_eq!(detail.worker.as_deref(), Some("worker-run-r-1"));
}

#[tokio::test]
async fn test_retry_reports_live_downstream_before_lock_contention() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Done, "k-1");
    fx.add_downstream("r-down", RunStatus::Running, "k-1");

    let mut holder = fx.store.begin_memory();
    holder
        .lock_data(&knit_ids(&["k-1"]), LockMode::FailOnContention)
        .await
        .unwrap();

    expect_kind(
        fx.lifecycle.retry(&RunId::from("r-1")).await,
        ErrorKind::DownstreamConflict,
    );
}

#[tokio::test]
async fn test_retry_refuses_run_with_active_worker() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Failed, "k-1");
    let run_id = RunId::from("r-1");
    fx.store.add_worker(&run_id, "worker-run-r-1").unwrap();
    let before = fx.store.snapshot().unwrap();

    let err = fx.lifecycle.retry(&run_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerActive);
    match err {
        LifecycleError::WorkerActive { worker, .. } => assert_eq!(worker, "worker-run-r-1"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(fx.store.snapshot().unwrap(), before);

    assert!(fx.lifecycle.delete_worker(&run_id).await.unwrap());
    assert!(!fx.lifecycle.delete_worker(&run_id).await.unwrap());

    let outcome = fx.lifecycle.retry(&run_id).await.unwrap();
    assert_eq!(outcome.transition.to, RunStatus::Waiting);
    assert_eq!(
        fx.store.snapshot().unwrap().workers.get(&run_id).map(String::as_str),
        Some("worker-run-r-1")
    );
}

#[tokio::test]
async fn test_delete_worker_unknown_run_is_missing() {
    let fx = Fixture::new().with_plans();
    expect_kind(
        fx.lifecycle.delete_worker(&RunId::from("nope")).await,
        ErrorKind::Missing,
    );
}

#[tokio::test]
async fn test_retry_rolls_back_when_drop_data_fails() {
    let fx = Fixture::with_nominator(RecordingNominator::failing_drop()).with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Done, "k-1");
    fx.store
        .add_run_exit(
            &RunId::from("r-1"),
            RunExit {
                code: 0,
                message: "Completed".to_string(),
            },
        )
        .unwrap();
    fx.add_downstream("r-down", RunStatus::Invalidated, "k-1");
    let before = fx.store.snapshot().unwrap();

    expect_kind(
        fx.lifecycle.retry(&RunId::from("r-1")).await,
        ErrorKind::Collaborator,
    );

    assert_eq!(fx.nominator.calls(), vec![Call::DropData(knit_ids(&["k-1"]))]);
    assert_eq!(fx.store.snapshot().unwrap(), before);
}

#[tokio::test]
async fn test_retry_skips_cascade_rows_locked_elsewhere() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Done, "k-1");
    fx.add_downstream("r-down", RunStatus::Invalidated, "k-1");
    let before = fx.store.snapshot().unwrap();

    let mut holder = fx.store.begin_memory();
    holder
        .lock_runs(&[RunId::from("r-down")], LockMode::FailOnContention)
        .await
        .unwrap();

    expect_kind(
        fx.lifecycle.retry(&RunId::from("r-1")).await,
        ErrorKind::LockContention,
    );
    assert_eq!(fx.store.snapshot().unwrap(), before);
    drop(holder);

    assert!(fx.lifecycle.retry(&RunId::from("r-1")).await.is_ok());
}

#[tokio::test]
async fn test_operations_compose_in_one_caller_transaction() {
    let fx = Fixture::new().with_plans();
    fx.add_run_with_output("r-1", "upstream", RunStatus::Completing, "k-1");
    let run_id = RunId::from("r-1");

    let mut tx = fx.store.begin_memory();
    let exit = RunExit {
        code: 0,
        message: "Completed".to_string(),
    };
    fx.lifecycle.set_exit_in(&mut tx, &run_id, &exit).await.unwrap();
    fx.lifecycle.finish_in(&mut tx, &run_id).await.unwrap();
    Box::new(tx).rollback().await.unwrap();

    let snapshot = fx.store.snapshot().unwrap();
    assert_eq!(snapshot.runs[&run_id].status, RunStatus::Completing);
    assert!(snapshot.run_exits.is_empty());
    assert!(snapshot.nominations.is_empty());
}
