//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use knitcore::domain::{
    DataRecord, Input, InputId, KnitId, Output, OutputId, Plan, PlanId, PlanKind, PseudoPlanName,
    RunId, RunRecord, RunStatus, Tag, TagSet,
};
use knitcore::error::NominationError;
use knitcore::nomination::{MatchingEngine, Nominator};
use knitcore::storage::{MemoryStore, Store, Transaction};

pub fn tags(pairs: &[(&str, &str)]) -> TagSet {
    pairs.iter().map(|(k, v)| Tag::new(*k, *v)).collect()
}

pub fn input(id: i64, tags: TagSet) -> Input {
    Input {
        input_id: InputId(id),
        path: format!("/in/{}", id),
        tags,
        timestamps: BTreeSet::new(),
        knit_ids: BTreeSet::new(),
    }
}

pub fn output(id: i64) -> Output {
    Output {
        output_id: OutputId(id),
        path: format!("/out/{}", id),
        tags: TagSet::new(),
        is_log: false,
    }
}

pub fn image_plan(id: &str, inputs: Vec<Input>, outputs: Vec<Output>) -> Plan {
    Plan {
        plan_id: PlanId::from(id),
        active: true,
        kind: PlanKind::Image {
            image: "repo.invalid/trainer".to_string(),
            version: "1.0".to_string(),
        },
        inputs,
        outputs,
    }
}

pub fn uploaded_plan(id: &str, output_id: i64) -> Plan {
    Plan {
        plan_id: PlanId::from(id),
        active: true,
        kind: PlanKind::Pseudo {
            name: PseudoPlanName::uploaded(),
        },
        inputs: Vec::new(),
        outputs: vec![output(output_id)],
    }
}

pub fn run(id: &str, plan: &str, status: RunStatus, at: DateTime<Utc>) -> RunRecord {
    RunRecord {
        run_id: RunId::from(id),
        plan_id: PlanId::from(plan),
        status,
        updated_at: at,
        lifecycle_suspend_until: at,
    }
}

pub fn data(knit: &str, run: &RunRecord, output_id: i64, tags: TagSet) -> DataRecord {
    DataRecord {
        knit_id: KnitId::from(knit),
        volume_ref: format!("vol-{}", knit),
        run_id: run.run_id.clone(),
        output_id: OutputId(output_id),
        plan_id: run.plan_id.clone(),
        tags,
        timestamp: None,
    }
}

pub fn knit_ids(ids: &[&str]) -> Vec<KnitId> {
    ids.iter().map(|id| KnitId::from(*id)).collect()
}

/// Runs one data-first pass in its own committed transaction.
pub async fn nominate_data(store: &MemoryStore, ids: &[KnitId]) {
    let mut tx = store.begin().await.expect("begin");
    MatchingEngine::new()
        .nominate_data(tx.as_mut(), ids)
        .await
        .expect("nominate data");
    tx.commit().await.expect("commit");
}

/// Runs one input-first pass in its own committed transaction.
pub async fn nominate_inputs(store: &MemoryStore, ids: &[InputId]) {
    let mut tx = store.begin().await.expect("begin");
    MatchingEngine::new()
        .nominate_mountpoints(tx.as_mut(), ids)
        .await
        .expect("nominate inputs");
    tx.commit().await.expect("commit");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NominateData(Vec<KnitId>),
    NominateMountpoints(Vec<InputId>),
    DropData(Vec<KnitId>),
}

/// Nominator that records every call and forwards it to a [`MatchingEngine`].
#[derive(Debug, Default)]
pub struct RecordingNominator {
    calls: Mutex<Vec<Call>>,
    fail_drop: bool,
    inner: MatchingEngine,
}

impl RecordingNominator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A nominator whose `drop_data` always fails.
    pub fn failing_drop() -> Arc<Self> {
        Arc::new(Self {
            fail_drop: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl Nominator for RecordingNominator {
    async fn nominate_data(
        &self,
        tx: &mut dyn Transaction,
        knit_ids: &[KnitId],
    ) -> Result<(), NominationError> {
        self.record(Call::NominateData(knit_ids.to_vec()));
        self.inner.nominate_data(tx, knit_ids).await
    }

    async fn nominate_mountpoints(
        &self,
        tx: &mut dyn Transaction,
        input_ids: &[InputId],
    ) -> Result<(), NominationError> {
        self.record(Call::NominateMountpoints(input_ids.to_vec()));
        self.inner.nominate_mountpoints(tx, input_ids).await
    }

    async fn drop_data(
        &self,
        tx: &mut dyn Transaction,
        knit_ids: &[KnitId],
    ) -> Result<(), NominationError> {
        self.record(Call::DropData(knit_ids.to_vec()));
        if self.fail_drop {
            return Err(NominationError::Failed("drop refused".to_string()));
        }
        self.inner.drop_data(tx, knit_ids).await
    }
}
