//! PostgreSQL implementation of the storage port.
//!
//! Row locks map to `SELECT ... FOR UPDATE NOWAIT` and
//! `SELECT ... FOR UPDATE SKIP LOCKED`; the nomination lock is a table lock
//! in `EXCLUSIVE` mode. All of them are held until the transaction ends.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres};

use super::migrations::MigrationRunner;
use super::port::{
    DataScope, InputScope, LockMode, Locked, NominationScope, StorageError, Store, Transaction,
};
use super::schema::tables;
use crate::config::DatabaseConfig;
use crate::domain::{
    Assignment, DataCandidate, DataRecord, Input, InputCriteria, InputId, KnitId, Nomination,
    NominationKey, Output, OutputId, Plan, PlanId, PlanKind, PseudoPlanName, RunExit, RunId,
    RunRecord, RunStatus, Tag, TagSet,
};

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects a pool configured by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema and seeds the system pseudo plans.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Begins a transaction with its concrete type.
    pub async fn begin_pg(&self) -> Result<PgTransaction, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction {
            tx,
            now: None,
            holds_nomination_lock: false,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(self.begin_pg().await?))
    }
}

/// A transaction on a [`PgStore`]. Dropping it rolls back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    now: Option<DateTime<Utc>>,
    holds_nomination_lock: bool,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("now", &self.now)
            .field("holds_nomination_lock", &self.holds_nomination_lock)
            .finish()
    }
}

fn sqlstate_is(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(code),
        _ => false,
    }
}

/// Classifies a failed write against `relation`.
fn write_error(relation: &str, err: sqlx::Error) -> StorageError {
    if sqlstate_is(&err, UNIQUE_VIOLATION) {
        StorageError::duplicate(relation, err.to_string())
    } else if sqlstate_is(&err, FOREIGN_KEY_VIOLATION) {
        StorageError::dangling(relation, err.to_string())
    } else {
        StorageError::QueryFailed(err)
    }
}

fn parse_status(text: &str) -> Result<RunStatus, StorageError> {
    text.parse()
        .map_err(|e: crate::domain::UnknownRunStatus| StorageError::corrupted(tables::RUN, e.to_string()))
}

fn strings<T: ToString>(ids: &[T]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

type RunRow = (String, String, String, DateTime<Utc>, DateTime<Utc>);

fn run_from_row(row: RunRow) -> Result<RunRecord, StorageError> {
    let (run_id, plan_id, status, updated_at, lifecycle_suspend_until) = row;
    Ok(RunRecord {
        run_id: RunId(run_id),
        plan_id: PlanId(plan_id),
        status: parse_status(&status)?,
        updated_at,
        lifecycle_suspend_until,
    })
}

type DataRow = (String, String, String, i64, String, Option<DateTime<Utc>>);

const SELECT_RUN: &str =
    "SELECT run_id, plan_id, status, updated_at, lifecycle_suspend_until FROM run";

const SELECT_DATA: &str = r#"
    SELECT d.knit_id, d.volume_ref, d.run_id, d.output_id, d.plan_id, kt.timestamp
    FROM data d
    LEFT JOIN knit_timestamp kt ON kt.knit_id = d.knit_id
"#;

impl PgTransaction {
    /// Locks rows of `table` by primary key.
    async fn lock_rows(
        &mut self,
        table: &str,
        column: &str,
        keys: Vec<String>,
        mode: LockMode,
    ) -> Result<Locked<String>, StorageError> {
        if keys.is_empty() {
            return Ok(Locked::default());
        }

        match mode {
            LockMode::FailOnContention => {
                let sql = format!(
                    "SELECT {column} FROM {table} WHERE {column} = ANY($1) ORDER BY {column} FOR UPDATE NOWAIT"
                );
                let rows: Vec<(String,)> = sqlx::query_as(&sql)
                    .bind(&keys)
                    .fetch_all(&mut *self.tx)
                    .await
                    .map_err(|e| {
                        if sqlstate_is(&e, LOCK_NOT_AVAILABLE) {
                            StorageError::contention(table, keys.iter().cloned())
                        } else {
                            StorageError::QueryFailed(e)
                        }
                    })?;

                Ok(Locked {
                    acquired: rows.into_iter().map(|(k,)| k).collect(),
                    skipped: Vec::new(),
                })
            }
            LockMode::SkipLocked => {
                let sql = format!("SELECT {column} FROM {table} WHERE {column} = ANY($1)");
                let present: Vec<(String,)> = sqlx::query_as(&sql)
                    .bind(&keys)
                    .fetch_all(&mut *self.tx)
                    .await?;

                let sql = format!(
                    "SELECT {column} FROM {table} WHERE {column} = ANY($1) ORDER BY {column} FOR UPDATE SKIP LOCKED"
                );
                let locked: Vec<(String,)> = sqlx::query_as(&sql)
                    .bind(&keys)
                    .fetch_all(&mut *self.tx)
                    .await?;

                let acquired: Vec<String> = locked.into_iter().map(|(k,)| k).collect();
                let taken: BTreeSet<&String> = acquired.iter().collect();
                let mut skipped: Vec<String> = present
                    .into_iter()
                    .map(|(k,)| k)
                    .filter(|k| !taken.contains(k))
                    .collect();
                skipped.sort();

                Ok(Locked { acquired, skipped })
            }
        }
    }

    /// Loads `(owner, key, value)` rows of a tag relation keyed by an integer.
    async fn tags_by_int(
        &mut self,
        sql: &str,
        owners: &[i64],
    ) -> Result<HashMap<i64, TagSet>, StorageError> {
        let mut sets: HashMap<i64, TagSet> = HashMap::new();
        if owners.is_empty() {
            return Ok(sets);
        }

        let rows: Vec<(i64, String, String)> = sqlx::query_as(sql)
            .bind(owners)
            .fetch_all(&mut *self.tx)
            .await?;
        for (owner, key, value) in rows {
            sets.entry(owner).or_default().insert(Tag::new(key, value));
        }
        Ok(sets)
    }

    async fn tags_of_data(
        &mut self,
        knit_ids: &[String],
    ) -> Result<HashMap<String, TagSet>, StorageError> {
        let mut sets: HashMap<String, TagSet> = HashMap::new();
        if knit_ids.is_empty() {
            return Ok(sets);
        }

        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT knit_id, key, value FROM tag_data WHERE knit_id = ANY($1)")
                .bind(knit_ids)
                .fetch_all(&mut *self.tx)
                .await?;
        for (knit_id, key, value) in rows {
            sets.entry(knit_id).or_default().insert(Tag::new(key, value));
        }
        Ok(sets)
    }

    async fn data_from_rows(&mut self, rows: Vec<DataRow>) -> Result<Vec<DataRecord>, StorageError> {
        let ids: Vec<String> = rows.iter().map(|row| row.0.clone()).collect();
        let mut tags = self.tags_of_data(&ids).await?;

        Ok(rows
            .into_iter()
            .map(|(knit_id, volume_ref, run_id, output_id, plan_id, timestamp)| DataRecord {
                tags: tags.remove(&knit_id).unwrap_or_default(),
                knit_id: KnitId(knit_id),
                volume_ref,
                run_id: RunId(run_id),
                output_id: OutputId(output_id),
                plan_id: PlanId(plan_id),
                timestamp,
            })
            .collect())
    }

    /// Criteria of the inputs named by `(input_id, plan_id)` rows.
    async fn criteria_from_rows(
        &mut self,
        rows: Vec<(i64, String)>,
    ) -> Result<Vec<InputCriteria>, StorageError> {
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tags = self
            .tags_by_int(
                "SELECT input_id, key, value FROM tag_input WHERE input_id = ANY($1)",
                &ids,
            )
            .await?;

        let knit_rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT input_id, knit_id FROM knitid_input WHERE input_id = ANY($1)")
                .bind(&ids)
                .fetch_all(&mut *self.tx)
                .await?;
        let mut knit_ids: HashMap<i64, BTreeSet<KnitId>> = HashMap::new();
        for (input_id, knit_id) in knit_rows {
            knit_ids.entry(input_id).or_default().insert(KnitId(knit_id));
        }

        let ts_rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT input_id, timestamp FROM timestamp_input WHERE input_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;
        let mut timestamps: HashMap<i64, BTreeSet<DateTime<Utc>>> = HashMap::new();
        for (input_id, at) in ts_rows {
            timestamps.entry(input_id).or_default().insert(at);
        }

        Ok(rows
            .into_iter()
            .map(|(input_id, plan_id)| InputCriteria {
                input_id: InputId(input_id),
                plan_id: PlanId(plan_id),
                tags: tags.remove(&input_id).unwrap_or_default(),
                timestamps: timestamps.remove(&input_id).unwrap_or_default(),
                knit_ids: knit_ids.remove(&input_id).unwrap_or_default(),
            })
            .collect())
    }

    async fn plan_kind(&mut self, plan_id: &PlanId) -> Result<PlanKind, StorageError> {
        let pseudo: Option<(String,)> =
            sqlx::query_as("SELECT name FROM plan_pseudo WHERE plan_id = $1")
                .bind(plan_id.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;
        if let Some((name,)) = pseudo {
            let name = PseudoPlanName::new(name.clone()).ok_or_else(|| {
                StorageError::corrupted(
                    tables::PLAN_PSEUDO,
                    format!("'{}' is not a pseudo plan name", name),
                )
            })?;
            return Ok(PlanKind::Pseudo { name });
        }

        let image: Option<(String, String)> =
            sqlx::query_as("SELECT image, version FROM plan_image WHERE plan_id = $1")
                .bind(plan_id.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;
        match image {
            Some((image, version)) => Ok(PlanKind::Image { image, version }),
            None => Err(StorageError::corrupted(
                tables::PLAN,
                format!("plan {} is neither pseudo nor image", plan_id),
            )),
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn now(&mut self) -> Result<DateTime<Utc>, StorageError> {
        if let Some(now) = self.now {
            return Ok(now);
        }
        // now() is the transaction start time in PostgreSQL.
        let (now,): (DateTime<Utc>,) = sqlx::query_as("SELECT now()")
            .fetch_one(&mut *self.tx)
            .await?;
        self.now = Some(now);
        Ok(now)
    }

    async fn lock_runs(
        &mut self,
        run_ids: &[RunId],
        mode: LockMode,
    ) -> Result<Locked<RunId>, StorageError> {
        let locked = self
            .lock_rows(tables::RUN, "run_id", strings(run_ids), mode)
            .await?;
        Ok(Locked {
            acquired: locked.acquired.into_iter().map(RunId).collect(),
            skipped: locked.skipped.into_iter().map(RunId).collect(),
        })
    }

    async fn lock_data(
        &mut self,
        knit_ids: &[KnitId],
        mode: LockMode,
    ) -> Result<Locked<KnitId>, StorageError> {
        let locked = self
            .lock_rows(tables::DATA, "knit_id", strings(knit_ids), mode)
            .await?;
        Ok(Locked {
            acquired: locked.acquired.into_iter().map(KnitId).collect(),
            skipped: locked.skipped.into_iter().map(KnitId).collect(),
        })
    }

    async fn lock_nominations(&mut self) -> Result<(), StorageError> {
        if self.holds_nomination_lock {
            return Ok(());
        }
        sqlx::query("LOCK TABLE nomination IN EXCLUSIVE MODE")
            .execute(&mut *self.tx)
            .await?;
        self.holds_nomination_lock = true;
        Ok(())
    }

    async fn find_pseudo_plan(
        &mut self,
        name: &PseudoPlanName,
    ) -> Result<Option<Plan>, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT plan_id FROM plan_pseudo WHERE name = $1")
                .bind(name.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;
        match row {
            Some((plan_id,)) => self.get_plan(&PlanId(plan_id)).await,
            None => Ok(None),
        }
    }

    async fn get_plan(&mut self, plan_id: &PlanId) -> Result<Option<Plan>, StorageError> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT active FROM plan WHERE plan_id = $1")
            .bind(plan_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        let Some((active,)) = row else {
            return Ok(None);
        };
        let kind = self.plan_kind(plan_id).await?;

        let input_rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT input_id, plan_id, path FROM input WHERE plan_id = $1 ORDER BY input_id",
        )
        .bind(plan_id.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        let paths: HashMap<i64, String> = input_rows
            .iter()
            .map(|(id, _, path)| (*id, path.clone()))
            .collect();
        let criteria = self
            .criteria_from_rows(
                input_rows
                    .into_iter()
                    .map(|(id, plan, _)| (id, plan))
                    .collect(),
            )
            .await?;
        let inputs = criteria
            .into_iter()
            .map(|c| Input {
                path: paths.get(&c.input_id.0).cloned().unwrap_or_default(),
                input_id: c.input_id,
                tags: c.tags,
                timestamps: c.timestamps,
                knit_ids: c.knit_ids,
            })
            .collect();

        let output_rows: Vec<(i64, String, bool)> = sqlx::query_as(
            "SELECT output_id, path, is_log FROM output WHERE plan_id = $1 ORDER BY output_id",
        )
        .bind(plan_id.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        let output_ids: Vec<i64> = output_rows.iter().map(|(id, _, _)| *id).collect();
        let mut output_tags = self
            .tags_by_int(
                "SELECT output_id, key, value FROM tag_output WHERE output_id = ANY($1)",
                &output_ids,
            )
            .await?;
        let outputs = output_rows
            .into_iter()
            .map(|(output_id, path, is_log)| Output {
                output_id: OutputId(output_id),
                path,
                tags: output_tags.remove(&output_id).unwrap_or_default(),
                is_log,
            })
            .collect();

        Ok(Some(Plan {
            plan_id: plan_id.clone(),
            active,
            kind,
            inputs,
            outputs,
        }))
    }

    async fn input_criteria(
        &mut self,
        scope: InputScope<'_>,
    ) -> Result<Vec<InputCriteria>, StorageError> {
        let rows: Vec<(i64, String)> = match scope {
            InputScope::All => {
                sqlx::query_as("SELECT input_id, plan_id FROM input ORDER BY input_id")
                    .fetch_all(&mut *self.tx)
                    .await?
            }
            InputScope::InputIds(ids) => {
                let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
                sqlx::query_as(
                    "SELECT input_id, plan_id FROM input WHERE input_id = ANY($1) ORDER BY input_id",
                )
                .bind(&ids)
                .fetch_all(&mut *self.tx)
                .await?
            }
        };
        self.criteria_from_rows(rows).await
    }

    async fn get_run(&mut self, run_id: &RunId) -> Result<Option<RunRecord>, StorageError> {
        let row: Option<RunRow> = sqlx::query_as(&format!("{} WHERE run_id = $1", SELECT_RUN))
            .bind(run_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(run_from_row).transpose()
    }

    async fn insert_run(&mut self, run: &RunRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO run (run_id, plan_id, status, updated_at, lifecycle_suspend_until)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.plan_id.as_str())
        .bind(run.status.as_str())
        .bind(run.updated_at)
        .bind(run.lifecycle_suspend_until)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| write_error(tables::RUN, e))?;

        Ok(())
    }

    async fn update_run(&mut self, run: &RunRecord) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE run
            SET status = $2, updated_at = $3, lifecycle_suspend_until = $4
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.status.as_str())
        .bind(run.updated_at)
        .bind(run.lifecycle_suspend_until)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::dangling(tables::RUN, run.run_id.to_string()));
        }
        Ok(())
    }

    async fn delete_runs(&mut self, run_ids: &[RunId]) -> Result<(), StorageError> {
        if run_ids.is_empty() {
            return Ok(());
        }
        let ids = strings(run_ids);

        // run_exit and worker rows cascade with the run.
        sqlx::query("DELETE FROM assign WHERE run_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM run WHERE run_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| write_error(tables::DATA, e))?;

        Ok(())
    }

    async fn downstream_runs(
        &mut self,
        knit_ids: &[KnitId],
    ) -> Result<Vec<RunRecord>, StorageError> {
        if knit_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "{} WHERE run_id IN (SELECT run_id FROM assign WHERE knit_id = ANY($1)) ORDER BY run_id",
            SELECT_RUN
        ))
        .bind(strings(knit_ids))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    async fn assignments(&mut self, run_id: &RunId) -> Result<Vec<Assignment>, StorageError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT input_id, knit_id FROM assign WHERE run_id = $1 ORDER BY input_id",
        )
        .bind(run_id.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(input_id, knit_id)| Assignment {
                input_id: InputId(input_id),
                knit_id: KnitId(knit_id),
            })
            .collect())
    }

    async fn get_run_exit(&mut self, run_id: &RunId) -> Result<Option<RunExit>, StorageError> {
        let row: Option<(i16, String)> =
            sqlx::query_as("SELECT exit_code, message FROM run_exit WHERE run_id = $1")
                .bind(run_id.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;

        row.map(|(code, message)| {
            let code = u8::try_from(code).map_err(|_| {
                StorageError::corrupted(tables::RUN_EXIT, format!("exit code {} out of range", code))
            })?;
            Ok(RunExit { code, message })
        })
        .transpose()
    }

    async fn upsert_run_exit(
        &mut self,
        run_id: &RunId,
        exit: &RunExit,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO run_exit (run_id, exit_code, message) VALUES ($1, $2, $3)
            ON CONFLICT (run_id) DO UPDATE SET
                exit_code = EXCLUDED.exit_code,
                message = EXCLUDED.message
            "#,
        )
        .bind(run_id.as_str())
        .bind(i16::from(exit.code))
        .bind(&exit.message)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| write_error(tables::RUN_EXIT, e))?;

        Ok(())
    }

    async fn delete_run_exit(&mut self, run_id: &RunId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM run_exit WHERE run_id = $1")
            .bind(run_id.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_worker(&mut self, run_id: &RunId) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM worker WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|(name,)| name))
    }

    async fn upsert_worker(&mut self, run_id: &RunId, name: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO worker (run_id, name) VALUES ($1, $2) ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(run_id.as_str())
        .bind(name)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| write_error(tables::WORKER, e))?;
        Ok(())
    }

    async fn delete_worker(&mut self, run_id: &RunId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM worker WHERE run_id = $1")
            .bind(run_id.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn data_of_run(&mut self, run_id: &RunId) -> Result<Vec<DataRecord>, StorageError> {
        let rows: Vec<DataRow> = sqlx::query_as(&format!(
            "{} WHERE d.run_id = $1 ORDER BY d.knit_id",
            SELECT_DATA
        ))
        .bind(run_id.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        self.data_from_rows(rows).await
    }

    async fn insert_data(&mut self, data: &DataRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO data (knit_id, volume_ref, run_id, output_id, plan_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(data.knit_id.as_str())
        .bind(&data.volume_ref)
        .bind(data.run_id.as_str())
        .bind(data.output_id.0)
        .bind(data.plan_id.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| write_error(tables::DATA, e))?;

        for tag in data.tags.user().iter() {
            sqlx::query("INSERT INTO tag_data (knit_id, key, value) VALUES ($1, $2, $3)")
                .bind(data.knit_id.as_str())
                .bind(&tag.key)
                .bind(&tag.value)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| write_error(tables::TAG_DATA, e))?;
        }

        if let Some(at) = data.timestamp {
            sqlx::query("INSERT INTO knit_timestamp (knit_id, timestamp) VALUES ($1, $2)")
                .bind(data.knit_id.as_str())
                .bind(at)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| write_error(tables::KNIT_TIMESTAMP, e))?;
        }

        Ok(())
    }

    async fn set_timestamps(
        &mut self,
        knit_ids: &[KnitId],
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if knit_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO knit_timestamp (knit_id, timestamp)
            SELECT knit_id, $2 FROM data WHERE knit_id = ANY($1)
            ON CONFLICT (knit_id) DO NOTHING
            "#,
        )
        .bind(strings(knit_ids))
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn discard_data(&mut self, knit_ids: &[KnitId]) -> Result<(), StorageError> {
        if knit_ids.is_empty() {
            return Ok(());
        }
        let ids = strings(knit_ids);

        sqlx::query(
            r#"
            INSERT INTO garbage (knit_id, volume_ref)
            SELECT knit_id, volume_ref FROM data WHERE knit_id = ANY($1)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&ids)
        .execute(&mut *self.tx)
        .await?;

        // Tags, timestamps and nominations cascade; assignments block.
        sqlx::query("DELETE FROM data WHERE knit_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| write_error(tables::ASSIGN, e))?;

        Ok(())
    }

    async fn data_candidates(
        &mut self,
        scope: DataScope<'_>,
    ) -> Result<Vec<DataCandidate>, StorageError> {
        const SELECT_CANDIDATE: &str = r#"
            SELECT d.knit_id, r.status, kt.timestamp
            FROM data d
            JOIN run r ON r.run_id = d.run_id
            LEFT JOIN knit_timestamp kt ON kt.knit_id = d.knit_id
        "#;

        let rows: Vec<(String, String, Option<DateTime<Utc>>)> = match scope {
            DataScope::KnitIds(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                sqlx::query_as(&format!(
                    "{} WHERE d.knit_id = ANY($1) ORDER BY d.knit_id",
                    SELECT_CANDIDATE
                ))
                .bind(strings(ids))
                .fetch_all(&mut *self.tx)
                .await?
            }
            DataScope::Done => {
                sqlx::query_as(&format!(
                    "{} WHERE r.status = $1 ORDER BY d.knit_id",
                    SELECT_CANDIDATE
                ))
                .bind(RunStatus::Done.as_str())
                .fetch_all(&mut *self.tx)
                .await?
            }
        };

        let ids: Vec<String> = rows.iter().map(|row| row.0.clone()).collect();
        let mut tags = self.tags_of_data(&ids).await?;

        rows.into_iter()
            .map(|(knit_id, status, timestamp)| {
                Ok(DataCandidate {
                    tags: tags.remove(&knit_id).unwrap_or_default(),
                    knit_id: KnitId(knit_id),
                    timestamp,
                    run_status: parse_status(&status)?,
                })
            })
            .collect()
    }

    async fn nominations(
        &mut self,
        scope: NominationScope<'_>,
    ) -> Result<Vec<Nomination>, StorageError> {
        let (knit_ids, input_ids): (Option<Vec<String>>, Option<Vec<i64>>) = match scope {
            NominationScope::KnitIds(ids) => (Some(strings(ids)), None),
            NominationScope::InputIds(ids) => (None, Some(ids.iter().map(|id| id.0).collect())),
            NominationScope::All => (None, None),
        };

        let rows: Vec<(i64, String, bool)> = sqlx::query_as(
            r#"
            SELECT input_id, knit_id, updated FROM nomination
            WHERE ($1::TEXT[] IS NULL OR knit_id = ANY($1))
              AND ($2::BIGINT[] IS NULL OR input_id = ANY($2))
            ORDER BY input_id, knit_id
            "#,
        )
        .bind(knit_ids)
        .bind(input_ids)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(input_id, knit_id, updated)| Nomination {
                input_id: InputId(input_id),
                knit_id: KnitId(knit_id),
                updated,
            })
            .collect())
    }

    async fn insert_nominations(&mut self, keys: &[NominationKey]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let input_ids: Vec<i64> = keys.iter().map(|k| k.input_id.0).collect();
        let knit_ids: Vec<String> = keys.iter().map(|k| k.knit_id.to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO nomination (input_id, knit_id, updated)
            SELECT input_id, knit_id, TRUE FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS n(input_id, knit_id)
            ON CONFLICT (input_id, knit_id) DO NOTHING
            "#,
        )
        .bind(&input_ids)
        .bind(&knit_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| write_error(tables::NOMINATION, e))?;

        Ok(())
    }

    async fn delete_nominations(&mut self, keys: &[NominationKey]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let input_ids: Vec<i64> = keys.iter().map(|k| k.input_id.0).collect();
        let knit_ids: Vec<String> = keys.iter().map(|k| k.knit_id.to_string()).collect();

        sqlx::query(
            r#"
            DELETE FROM nomination
            WHERE (input_id, knit_id) IN (
                SELECT input_id, knit_id FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS n(input_id, knit_id)
            )
            "#,
        )
        .bind(&input_ids)
        .bind(&knit_ids)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn delete_nominations_for_data(
        &mut self,
        knit_ids: &[KnitId],
    ) -> Result<u64, StorageError> {
        if knit_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM nomination WHERE knit_id = ANY($1)")
            .bind(strings(knit_ids))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_rejects_unknown_text() {
        assert_eq!(parse_status("done").unwrap(), RunStatus::Done);

        let err = parse_status("exploded").unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_non_database_errors_are_not_classified() {
        let err = write_error(tables::RUN, sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::QueryFailed(_)));
        assert!(!sqlstate_is(&sqlx::Error::PoolTimedOut, LOCK_NOT_AVAILABLE));
    }

    #[test]
    fn test_run_row_conversion() {
        let now = Utc::now();
        let run = run_from_row((
            "r1".to_string(),
            "p1".to_string(),
            "completing".to_string(),
            now,
            now,
        ))
        .unwrap();
        assert_eq!(run.run_id, RunId::from("r1"));
        assert_eq!(run.status, RunStatus::Completing);
    }
}
