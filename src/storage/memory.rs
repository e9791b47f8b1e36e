//! In-memory store implementation for testing.
//!
//! [`MemoryStore`] keeps every relation in process memory and implements the
//! transactional contract of [`Store`]:
//!
//! - every write is journaled and undone on rollback or drop;
//! - row locks are owned by a transaction and released when it ends;
//! - the nomination relation lock is an async mutex held until the end of the
//!   owning transaction.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Uncommitted writes are visible** to other transactions; isolation comes
//!   from the locks only

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use super::port::{
    DataScope, InputScope, LockMode, Locked, NominationScope, StorageError, Store, Transaction,
};
use super::schema::tables;
use crate::domain::{
    Assignment, DataCandidate, DataRecord, InputCriteria, InputId, KnitId, Nomination,
    NominationKey, Plan, PlanId, PseudoPlanName, RunExit, RunId, RunRecord, RunStatus,
};

type Undo = Box<dyn FnOnce(&mut Tables) + Send>;

#[derive(Debug, Default, Clone)]
struct Tables {
    plans: BTreeMap<PlanId, Plan>,
    runs: BTreeMap<RunId, RunRecord>,
    run_exits: BTreeMap<RunId, RunExit>,
    workers: BTreeMap<RunId, String>,
    assigns: BTreeMap<(RunId, InputId), KnitId>,
    data: BTreeMap<KnitId, DataRecord>,
    nominations: BTreeMap<NominationKey, bool>,
    garbage: BTreeMap<KnitId, String>,
}

impl Tables {
    fn has_input(&self, input_id: InputId) -> bool {
        self.plans
            .values()
            .any(|plan| plan.inputs.iter().any(|input| input.input_id == input_id))
    }
}

fn runs(t: &mut Tables) -> &mut BTreeMap<RunId, RunRecord> {
    &mut t.runs
}

fn run_exits(t: &mut Tables) -> &mut BTreeMap<RunId, RunExit> {
    &mut t.run_exits
}

fn workers(t: &mut Tables) -> &mut BTreeMap<RunId, String> {
    &mut t.workers
}

fn assigns(t: &mut Tables) -> &mut BTreeMap<(RunId, InputId), KnitId> {
    &mut t.assigns
}

fn data(t: &mut Tables) -> &mut BTreeMap<KnitId, DataRecord> {
    &mut t.data
}

fn nominations(t: &mut Tables) -> &mut BTreeMap<NominationKey, bool> {
    &mut t.nominations
}

fn garbage(t: &mut Tables) -> &mut BTreeMap<KnitId, String> {
    &mut t.garbage
}

/// Writes (or removes, for `None`) one row and journals how to restore it.
fn put<K, V>(
    tables: &mut Tables,
    journal: &mut Vec<Undo>,
    table: fn(&mut Tables) -> &mut BTreeMap<K, V>,
    key: K,
    value: Option<V>,
) -> Option<V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let previous = match value {
        Some(value) => table(tables).insert(key.clone(), value),
        None => table(tables).remove(&key),
    };
    let restore = previous.clone();
    journal.push(Box::new(move |t: &mut Tables| match restore {
        Some(value) => {
            table(t).insert(key, value);
        }
        None => {
            table(t).remove(&key);
        }
    }));
    previous
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Run(RunId),
    Data(KnitId),
}

impl RowKey {
    fn label(&self) -> String {
        match self {
            RowKey::Run(id) => id.to_string(),
            RowKey::Data(id) => id.to_string(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, u64>>,
    nomination_lock: Arc<tokio::sync::Mutex<()>>,
    next_tx: AtomicU64,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Poisoned("memory store mutex poisoned".to_string())
}

/// Committed contents of a [`MemoryStore`], for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub runs: BTreeMap<RunId, RunRecord>,
    pub run_exits: BTreeMap<RunId, RunExit>,
    pub workers: BTreeMap<RunId, String>,
    pub assignments: BTreeMap<(RunId, InputId), KnitId>,
    pub data: BTreeMap<KnitId, DataRecord>,
    pub nominations: Vec<Nomination>,
    pub garbage: BTreeMap<KnitId, String>,
}

impl Snapshot {
    pub fn data_of_run(&self, run_id: &RunId) -> Vec<&DataRecord> {
        self.data.values().filter(|d| &d.run_id == run_id).collect()
    }
}

/// In-memory [`Store`] for tests and local experiments.
///
/// The `add_*` methods seed rows outside any transaction.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                nomination_lock: Arc::new(tokio::sync::Mutex::new(())),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    fn seed<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut tables = self.shared.tables.lock().map_err(poison_err)?;
        f(&mut tables)
    }

    /// Registers a plan with its inputs and outputs.
    ///
    /// Plans whose input tags use a reserved key are rejected.
    pub fn add_plan(&self, plan: Plan) -> Result<(), StorageError> {
        plan.check_criteria()?;
        self.seed(|t| {
            if t.plans.contains_key(&plan.plan_id) {
                return Err(StorageError::duplicate(tables::PLAN, plan.plan_id.to_string()));
            }
            t.plans.insert(plan.plan_id.clone(), plan);
            Ok(())
        })
    }

    pub fn add_run(&self, run: RunRecord) -> Result<(), StorageError> {
        self.seed(|t| {
            if !t.plans.contains_key(&run.plan_id) {
                return Err(StorageError::dangling(tables::RUN, run.plan_id.to_string()));
            }
            t.runs.insert(run.run_id.clone(), run);
            Ok(())
        })
    }

    pub fn add_data(&self, record: DataRecord) -> Result<(), StorageError> {
        self.seed(|t| {
            if !t.runs.contains_key(&record.run_id) {
                return Err(StorageError::dangling(tables::DATA, record.run_id.to_string()));
            }
            t.data.insert(record.knit_id.clone(), record);
            Ok(())
        })
    }

    /// Binds `knit_id` to an input of `run_id`.
    pub fn add_assignment(
        &self,
        run_id: &RunId,
        input_id: InputId,
        knit_id: &KnitId,
    ) -> Result<(), StorageError> {
        self.seed(|t| {
            if !t.runs.contains_key(run_id) || !t.data.contains_key(knit_id) {
                return Err(StorageError::dangling(
                    tables::ASSIGN,
                    format!("{} <- {}", run_id, knit_id),
                ));
            }
            t.assigns
                .insert((run_id.clone(), input_id), knit_id.clone());
            Ok(())
        })
    }

    pub fn add_run_exit(&self, run_id: &RunId, exit: RunExit) -> Result<(), StorageError> {
        self.seed(|t| {
            t.run_exits.insert(run_id.clone(), exit);
            Ok(())
        })
    }

    pub fn add_worker(&self, run_id: &RunId, name: &str) -> Result<(), StorageError> {
        self.seed(|t| {
            t.workers.insert(run_id.clone(), name.to_string());
            Ok(())
        })
    }

    pub fn add_nomination(&self, nomination: Nomination) -> Result<(), StorageError> {
        self.seed(|t| {
            t.nominations.insert(nomination.key(), nomination.updated);
            Ok(())
        })
    }

    /// Copies the current contents of every mutable relation.
    pub fn snapshot(&self) -> Result<Snapshot, StorageError> {
        self.seed(|t| {
            Ok(Snapshot {
                runs: t.runs.clone(),
                run_exits: t.run_exits.clone(),
                workers: t.workers.clone(),
                assignments: t.assigns.clone(),
                data: t.data.clone(),
                nominations: t
                    .nominations
                    .iter()
                    .map(|(key, updated)| Nomination {
                        input_id: key.input_id,
                        knit_id: key.knit_id.clone(),
                        updated: *updated,
                    })
                    .collect(),
                garbage: t.garbage.clone(),
            })
        })
    }

    /// Begins a transaction with its concrete type.
    pub fn begin_memory(&self) -> MemoryTransaction {
        MemoryTransaction {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_tx.fetch_add(1, Ordering::SeqCst),
            now: Utc::now(),
            journal: Vec::new(),
            nomination_guard: None,
            finished: false,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(self.begin_memory()))
    }
}

/// A transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: u64,
    now: DateTime<Utc>,
    journal: Vec<Undo>,
    nomination_guard: Option<OwnedMutexGuard<()>>,
    finished: bool,
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("id", &self.id)
            .field("now", &self.now)
            .field("journal", &self.journal.len())
            .field("holds_nomination_lock", &self.nomination_guard.is_some())
            .finish()
    }
}

impl MemoryTransaction {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StorageError> {
        let tables = self.shared.tables.lock().map_err(poison_err)?;
        Ok(f(&tables))
    }

    fn write<R>(
        &mut self,
        f: impl FnOnce(&mut Tables, &mut Vec<Undo>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut tables = self.shared.tables.lock().map_err(poison_err)?;
        f(&mut tables, &mut self.journal)
    }

    fn lock_rows<K: Clone + Ord>(
        &self,
        relation: &str,
        keys: &[K],
        exists: impl Fn(&Tables, &K) -> bool,
        row_key: impl Fn(&K) -> RowKey,
        mode: LockMode,
    ) -> Result<Locked<K>, StorageError> {
        let wanted: BTreeSet<&K> = keys.iter().collect();
        let present: Vec<K> = self.read(|t| {
            wanted
                .into_iter()
                .filter(|k| exists(t, *k))
                .cloned()
                .collect()
        })?;

        let mut locks = self.shared.row_locks.lock().map_err(poison_err)?;
        let (free, held): (Vec<K>, Vec<K>) = present.into_iter().partition(|k| {
            locks
                .get(&row_key(k))
                .map_or(true, |holder| *holder == self.id)
        });

        if mode == LockMode::FailOnContention && !held.is_empty() {
            return Err(StorageError::contention(
                relation,
                held.iter().map(|k| row_key(k).label()),
            ));
        }

        for key in &free {
            locks.insert(row_key(key), self.id);
        }

        Ok(Locked {
            acquired: free,
            skipped: held,
        })
    }

    fn release(&mut self) {
        if let Ok(mut locks) = self.shared.row_locks.lock() {
            locks.retain(|_, holder| *holder != self.id);
        }
        self.nomination_guard = None;
    }

    fn undo(&mut self) -> Result<(), StorageError> {
        let journal = std::mem::take(&mut self.journal);
        let mut tables = self.shared.tables.lock().map_err(poison_err)?;
        for undo in journal.into_iter().rev() {
            undo(&mut tables);
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.undo() {
            tracing::error!(tx = self.id, error = %e, "rollback of dropped transaction failed");
        }
        self.release();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn now(&mut self) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.now)
    }

    async fn lock_runs(
        &mut self,
        run_ids: &[RunId],
        mode: LockMode,
    ) -> Result<Locked<RunId>, StorageError> {
        self.lock_rows(
            tables::RUN,
            run_ids,
            |t, id| t.runs.contains_key(id),
            |id| RowKey::Run(id.clone()),
            mode,
        )
    }

    async fn lock_data(
        &mut self,
        knit_ids: &[KnitId],
        mode: LockMode,
    ) -> Result<Locked<KnitId>, StorageError> {
        self.lock_rows(
            tables::DATA,
            knit_ids,
            |t, id| t.data.contains_key(id),
            |id| RowKey::Data(id.clone()),
            mode,
        )
    }

    async fn lock_nominations(&mut self) -> Result<(), StorageError> {
        if self.nomination_guard.is_none() {
            let guard = Arc::clone(&self.shared.nomination_lock).lock_owned().await;
            self.nomination_guard = Some(guard);
        }
        Ok(())
    }

    async fn find_pseudo_plan(
        &mut self,
        name: &PseudoPlanName,
    ) -> Result<Option<Plan>, StorageError> {
        self.read(|t| {
            t.plans
                .values()
                .find(|plan| plan.pseudo_name() == Some(name))
                .cloned()
        })
    }

    async fn get_plan(&mut self, plan_id: &PlanId) -> Result<Option<Plan>, StorageError> {
        self.read(|t| t.plans.get(plan_id).cloned())
    }

    async fn input_criteria(
        &mut self,
        scope: InputScope<'_>,
    ) -> Result<Vec<InputCriteria>, StorageError> {
        self.read(|t| {
            t.plans
                .values()
                .flat_map(Plan::criteria)
                .filter(|c| match scope {
                    InputScope::All => true,
                    InputScope::InputIds(ids) => ids.contains(&c.input_id),
                })
                .collect()
        })
    }

    async fn get_run(&mut self, run_id: &RunId) -> Result<Option<RunRecord>, StorageError> {
        self.read(|t| t.runs.get(run_id).cloned())
    }

    async fn insert_run(&mut self, run: &RunRecord) -> Result<(), StorageError> {
        self.write(|t, j| {
            if !t.plans.contains_key(&run.plan_id) {
                return Err(StorageError::dangling(tables::RUN, run.plan_id.to_string()));
            }
            if t.runs.contains_key(&run.run_id) {
                return Err(StorageError::duplicate(tables::RUN, run.run_id.to_string()));
            }
            put(t, j, runs, run.run_id.clone(), Some(run.clone()));
            Ok(())
        })
    }

    async fn update_run(&mut self, run: &RunRecord) -> Result<(), StorageError> {
        self.write(|t, j| {
            if !t.runs.contains_key(&run.run_id) {
                return Err(StorageError::dangling(tables::RUN, run.run_id.to_string()));
            }
            put(t, j, runs, run.run_id.clone(), Some(run.clone()));
            Ok(())
        })
    }

    async fn delete_runs(&mut self, run_ids: &[RunId]) -> Result<(), StorageError> {
        self.write(|t, j| {
            for run_id in run_ids {
                if let Some(produced) = t.data.values().find(|d| &d.run_id == run_id) {
                    return Err(StorageError::dangling(
                        tables::DATA,
                        format!("{} still produced by {}", produced.knit_id, run_id),
                    ));
                }
                let bound: Vec<(RunId, InputId)> = t
                    .assigns
                    .keys()
                    .filter(|(r, _)| r == run_id)
                    .cloned()
                    .collect();
                for key in bound {
                    put(t, j, assigns, key, None);
                }
                put(t, j, run_exits, run_id.clone(), None);
                put(t, j, workers, run_id.clone(), None);
                put(t, j, runs, run_id.clone(), None);
            }
            Ok(())
        })
    }

    async fn downstream_runs(
        &mut self,
        knit_ids: &[KnitId],
    ) -> Result<Vec<RunRecord>, StorageError> {
        self.read(|t| {
            let consumers: BTreeSet<&RunId> = t
                .assigns
                .iter()
                .filter(|(_, knit_id)| knit_ids.contains(knit_id))
                .map(|((run_id, _), _)| run_id)
                .collect();
            consumers
                .into_iter()
                .filter_map(|run_id| t.runs.get(run_id).cloned())
                .collect()
        })
    }

    async fn assignments(&mut self, run_id: &RunId) -> Result<Vec<Assignment>, StorageError> {
        self.read(|t| {
            t.assigns
                .iter()
                .filter(|((r, _), _)| r == run_id)
                .map(|((_, input_id), knit_id)| Assignment {
                    input_id: *input_id,
                    knit_id: knit_id.clone(),
                })
                .collect()
        })
    }

    async fn get_run_exit(&mut self, run_id: &RunId) -> Result<Option<RunExit>, StorageError> {
        self.read(|t| t.run_exits.get(run_id).cloned())
    }

    async fn upsert_run_exit(
        &mut self,
        run_id: &RunId,
        exit: &RunExit,
    ) -> Result<(), StorageError> {
        self.write(|t, j| {
            if !t.runs.contains_key(run_id) {
                return Err(StorageError::dangling(tables::RUN_EXIT, run_id.to_string()));
            }
            put(t, j, run_exits, run_id.clone(), Some(exit.clone()));
            Ok(())
        })
    }

    async fn delete_run_exit(&mut self, run_id: &RunId) -> Result<(), StorageError> {
        self.write(|t, j| {
            put(t, j, run_exits, run_id.clone(), None);
            Ok(())
        })
    }

    async fn get_worker(&mut self, run_id: &RunId) -> Result<Option<String>, StorageError> {
        self.read(|t| t.workers.get(run_id).cloned())
    }

    async fn upsert_worker(&mut self, run_id: &RunId, name: &str) -> Result<(), StorageError> {
        self.write(|t, j| {
            if !t.runs.contains_key(run_id) {
                return Err(StorageError::dangling(tables::WORKER, run_id.to_string()));
            }
            if !t.workers.contains_key(run_id) {
                put(t, j, workers, run_id.clone(), Some(name.to_string()));
            }
            Ok(())
        })
    }

    async fn delete_worker(&mut self, run_id: &RunId) -> Result<bool, StorageError> {
        self.write(|t, j| Ok(put(t, j, workers, run_id.clone(), None).is_some()))
    }

    async fn data_of_run(&mut self, run_id: &RunId) -> Result<Vec<DataRecord>, StorageError> {
        self.read(|t| {
            t.data
                .values()
                .filter(|d| &d.run_id == run_id)
                .cloned()
                .collect()
        })
    }

    async fn insert_data(&mut self, record: &DataRecord) -> Result<(), StorageError> {
        self.write(|t, j| {
            if !t.runs.contains_key(&record.run_id) {
                return Err(StorageError::dangling(tables::DATA, record.run_id.to_string()));
            }
            let clash = t.data.values().any(|d| {
                d.knit_id == record.knit_id
                    || d.volume_ref == record.volume_ref
                    || (d.run_id == record.run_id && d.output_id == record.output_id)
            });
            if clash {
                return Err(StorageError::duplicate(
                    tables::DATA,
                    record.knit_id.to_string(),
                ));
            }
            put(t, j, data, record.knit_id.clone(), Some(record.clone()));
            Ok(())
        })
    }

    async fn set_timestamps(
        &mut self,
        knit_ids: &[KnitId],
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.write(|t, j| {
            for knit_id in knit_ids {
                let Some(record) = t.data.get(knit_id) else {
                    continue;
                };
                if record.timestamp.is_some() {
                    continue;
                }
                let mut stamped = record.clone();
                stamped.timestamp = Some(at);
                put(t, j, data, knit_id.clone(), Some(stamped));
            }
            Ok(())
        })
    }

    async fn discard_data(&mut self, knit_ids: &[KnitId]) -> Result<(), StorageError> {
        self.write(|t, j| {
            for knit_id in knit_ids {
                if t.assigns.values().any(|k| k == knit_id) {
                    return Err(StorageError::dangling(
                        tables::ASSIGN,
                        format!("{} is still assigned", knit_id),
                    ));
                }
                let Some(record) = put(t, j, data, knit_id.clone(), None) else {
                    continue;
                };
                let nominated: Vec<NominationKey> = t
                    .nominations
                    .keys()
                    .filter(|key| &key.knit_id == knit_id)
                    .cloned()
                    .collect();
                for key in nominated {
                    put(t, j, nominations, key, None);
                }
                put(t, j, garbage, knit_id.clone(), Some(record.volume_ref));
            }
            Ok(())
        })
    }

    async fn data_candidates(
        &mut self,
        scope: DataScope<'_>,
    ) -> Result<Vec<DataCandidate>, StorageError> {
        self.read(|t| {
            t.data
                .values()
                .filter(|d| match scope {
                    DataScope::KnitIds(ids) => ids.contains(&d.knit_id),
                    DataScope::Done => true,
                })
                .filter_map(|d| {
                    let run = t.runs.get(&d.run_id)?;
                    if matches!(scope, DataScope::Done) && run.status != RunStatus::Done {
                        return None;
                    }
                    Some(DataCandidate {
                        knit_id: d.knit_id.clone(),
                        tags: d.tags.user(),
                        timestamp: d.timestamp,
                        run_status: run.status,
                    })
                })
                .collect()
        })
    }

    async fn nominations(
        &mut self,
        scope: NominationScope<'_>,
    ) -> Result<Vec<Nomination>, StorageError> {
        self.read(|t| {
            t.nominations
                .iter()
                .filter(|(key, _)| match scope {
                    NominationScope::KnitIds(ids) => ids.contains(&key.knit_id),
                    NominationScope::InputIds(ids) => ids.contains(&key.input_id),
                    NominationScope::All => true,
                })
                .map(|(key, updated)| Nomination {
                    input_id: key.input_id,
                    knit_id: key.knit_id.clone(),
                    updated: *updated,
                })
                .collect()
        })
    }

    async fn insert_nominations(&mut self, keys: &[NominationKey]) -> Result<(), StorageError> {
        self.write(|t, j| {
            for key in keys {
                if !t.data.contains_key(&key.knit_id) || !t.has_input(key.input_id) {
                    return Err(StorageError::dangling(
                        tables::NOMINATION,
                        format!("{} -> {}", key.knit_id, key.input_id),
                    ));
                }
                if !t.nominations.contains_key(key) {
                    put(t, j, nominations, key.clone(), Some(true));
                }
            }
            Ok(())
        })
    }

    async fn delete_nominations(&mut self, keys: &[NominationKey]) -> Result<(), StorageError> {
        self.write(|t, j| {
            for key in keys {
                put(t, j, nominations, key.clone(), None);
            }
            Ok(())
        })
    }

    async fn delete_nominations_for_data(
        &mut self,
        knit_ids: &[KnitId],
    ) -> Result<u64, StorageError> {
        self.write(|t, j| {
            let doomed: Vec<NominationKey> = t
                .nominations
                .keys()
                .filter(|key| knit_ids.contains(&key.knit_id))
                .cloned()
                .collect();
            for key in &doomed {
                put(t, j, nominations, key.clone(), None);
            }
            Ok(doomed.len() as u64)
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.journal.clear();
        self.finished = true;
        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        let undone = self.undo();
        self.finished = true;
        self.release();
        undone
    }
}
