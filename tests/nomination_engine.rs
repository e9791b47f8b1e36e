//! Integration tests for the nomination matching engine against the memory store.

mod common;

use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};

use common::*;
use knitcore::domain::{InputId, KnitId, Nomination, RunStatus};
use knitcore::nomination::{MatchingEngine, Nominator};
use knitcore::storage::{MemoryStore, NominationScope, StorageError, Store, Transaction};

fn tagset_1() -> knitcore::domain::TagSet {
    tags(&[
        ("input#tagset-1", "1 in 3"),
        ("input#tagset-1", "2 in 3"),
        ("input#tagset-1", "3 in 3"),
    ])
}

fn tagset_2() -> knitcore::domain::TagSet {
    tags(&[("input#tagset-2", "1 in 2"), ("input#tagset-2", "2 in 2")])
}

/// An upstream plan producing data and a consumer plan with two inputs.
fn seeded_store(status: RunStatus) -> MemoryStore {
    let store = MemoryStore::new();
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    store
        .add_plan(image_plan("upstream", Vec::new(), vec![output(10)]))
        .unwrap();
    store
        .add_plan(image_plan(
            "consumer",
            vec![input(1, tagset_1()), input(2, tagset_2())],
            vec![output(20)],
        ))
        .unwrap();

    let producer = run("r-up", "upstream", status, at);
    store.add_run(producer.clone()).unwrap();
    store
        .add_data(data("k-1", &producer, 10, tagset_1()))
        .unwrap();
    store
}

#[tokio::test]
async fn test_matching_tags_nominate_only_the_matching_input() {
    let store = seeded_store(RunStatus::Done);

    nominate_data(&store, &knit_ids(&["k-1"])).await;

    let snapshot = store.snapshot().unwrap();
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
async fn test_data_of_unfinished_runs_is_never_nominated() {
    for status in RunStatus::ALL {
        if status == RunStatus::Done {
            continue;
        }
        let store = seeded_store(status);

        nominate_data(&store, &knit_ids(&["k-1"])).await;
        nominate_inputs(&store, &[InputId(1), InputId(2)]).await;

        let snapshot = store.snapshot().unwrap();
        assert!(
            snapshot.nominations.is_empty(),
            "data of a {} run was nominated",
            status
        );
    }
}

#[tokio::test]
async fn test_input_without_criteria_is_never_nominated() {
    let store = seeded_store(RunStatus::Done);
    store
        .add_plan(image_plan(
            "greedy",
            vec![input(3, knitcore::domain::TagSet::new())],
            vec![output(30)],
        ))
        .unwrap();

    nominate_data(&store, &knit_ids(&["k-1"])).await;
    nominate_inputs(&store, &[InputId(3)]).await;

    let snapshot = store.snapshot().unwrap();
    assert!(snapshot
        .nominations
        .iter()
        .all(|n| n.input_id != InputId(3)));
}

#[tokio::test]
async fn test_plan_with_reserved_criterion_is_refused() {
    let store = seeded_store(RunStatus::Done);
    let reserved = input(3, tags(&[("knit#transient", "processing")]));

    let result = store.add_plan(image_plan("reserved", vec![reserved], vec![output(30)]));
    assert!(matches!(result, Err(StorageError::InvalidTag(_))));

    nominate_inputs(&store, &[InputId(3)]).await;
    assert!(store.snapshot().unwrap().nominations.is_empty());
}

#[tokio::test]
async fn test_repeated_pass_leaves_relation_identical() {
    let store = seeded_store(RunStatus::Done);

    nominate_data(&store, &knit_ids(&["k-1"])).await;
    let first = store.snapshot().unwrap();

    nominate_data(&store, &knit_ids(&["k-1"])).await;
    let second = store.snapshot().unwrap();

    assert_eq!(first.nominations, second.nominations);
    assert_eq!(first.nominations.len(), 1);
}

#[tokio::test]
async fn test_consumed_match_keeps_its_updated_flag() {
    let store = seeded_store(RunStatus::Done);
    store
        .add_nomination(Nomination {
            input_id: InputId(1),
            knit_id: KnitId::from("k-1"),
            updated: false,
        })
        .unwrap();

    nominate_data(&store, &knit_ids(&["k-1"])).await;

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.nominations.len(), 1);
    assert!(!snapshot.nominations[0].updated);
}

#[tokio::test]
async fn test_stale_nomination_is_removed() {
    let store = seeded_store(RunStatus::Done);
    store
        .add_nomination(Nomination {
            input_id: InputId(2),
            knit_id: KnitId::from("k-1"),
            updated: false,
        })
        .unwrap();

    nominate_data(&store, &knit_ids(&["k-1"])).await;

    let inputs: BTreeSet<InputId> = store
        .snapshot()
        .unwrap()
        .nominations
        .iter()
        .map(|n| n.input_id)
        .collect();
    assert_eq!(inputs, BTreeSet::from([InputId(1)]));
}

#[tokio::test]
async fn test_input_first_pass_reaches_the_same_relation() {
    let data_first = seeded_store(RunStatus::Done);
    nominate_data(&data_first, &knit_ids(&["k-1"])).await;

    let input_first = seeded_store(RunStatus::Done);
    nominate_inputs(&input_first, &[InputId(1), InputId(2)]).await;

    assert_eq!(
        data_first.snapshot().unwrap().nominations,
        input_first.snapshot().unwrap().nominations
    );
}

#[tokio::test]
async fn test_timestamp_and_knit_id_criteria() {
    let store = MemoryStore::new();
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let other = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();

    let mut by_time = input(1, tags(&[("kind", "image")]));
    by_time.timestamps.insert(at);
    let mut by_wrong_time = input(2, tags(&[("kind", "image")]));
    by_wrong_time.timestamps.insert(other);
    let mut by_id = input(3, knitcore::domain::TagSet::new());
    by_id.knit_ids.insert(KnitId::from("k-1"));

    store
        .add_plan(image_plan("upstream", Vec::new(), vec![output(10)]))
        .unwrap();
    store
        .add_plan(image_plan(
            "consumer",
            vec![by_time, by_wrong_time, by_id],
            vec![output(20)],
        ))
        .unwrap();

    let producer = run("r-up", "upstream", RunStatus::Done, at);
    store.add_run(producer.clone()).unwrap();
    let mut stamped = data("k-1", &producer, 10, tags(&[("kind", "image")]));
    stamped.timestamp = Some(at);
    store.add_data(stamped).unwrap();

    nominate_data(&store, &knit_ids(&["k-1"])).await;

    let inputs: Vec<InputId> = store
        .snapshot()
        .unwrap()
        .nominations
        .iter()
        .map(|n| n.input_id)
        .collect();
    assert_eq!(inputs, vec![InputId(1), InputId(3)]);
}

#[tokio::test]
async fn test_drop_data_removes_every_nomination() {
    let store = seeded_store(RunStatus::Done);
    nominate_data(&store, &knit_ids(&["k-1"])).await;
    store
        .add_nomination(Nomination {
            input_id: InputId(2),
            knit_id: KnitId::from("k-1"),
            updated: false,
        })
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    MatchingEngine::new()
        .drop_data(tx.as_mut(), &knit_ids(&["k-1"]))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(store.snapshot().unwrap().nominations.is_empty());
}

#[tokio::test]
async fn test_pass_rolled_back_with_its_transaction() {
    let store = seeded_store(RunStatus::Done);
    let engine = MatchingEngine::new();

    let mut tx = store.begin().await.unwrap();
    engine
        .nominate_data(tx.as_mut(), &knit_ids(&["k-1"]))
        .await
        .unwrap();
    let listed = engine
        .list(tx.as_mut(), NominationScope::KnitIds(&knit_ids(&["k-1"])))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    tx.rollback().await.unwrap();

    assert!(store.snapshot().unwrap().nominations.is_empty());
}

#[tokio::test]
async fn test_concurrent_passes_serialize() {
    let store = seeded_store(RunStatus::Done);

    let mut holder = store.begin_memory();
    holder.lock_nominations().await.unwrap();

    let pending = {
        let store = store.clone();
        tokio::spawn(async move { nominate_data(&store, &knit_ids(&["k-1"])).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert!(store.snapshot().unwrap().nominations.is_empty());

    Box::new(holder).commit().await.unwrap();
    pending.await.unwrap();
    assert_eq!(store.snapshot().unwrap().nominations.len(), 1);
}
