//! Database migration helpers.
//!
//! Applies the schema through a `_migrations` ledger and seeds the pseudo
//! plans every installation carries.

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::schema;
use crate::domain::PseudoPlanName;

/// Mountpoint of the single output every seeded pseudo plan has.
pub const PSEUDO_PLAN_OUTPUT_PATH: &str = "/out";

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations, then seeds the system pseudo plans.
    ///
    /// Running it repeatedly is harmless.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_migrations_table().await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let migration_name = format!("schema_v1_part_{}", idx);

            if !self.is_migration_applied(&migration_name).await? {
                self.apply_migration(&migration_name, statement).await?;
                tracing::debug!(migration = %migration_name, "applied migration");
            }
        }

        for name in PseudoPlanName::system() {
            self.seed_pseudo_plan(&name).await?;
        }

        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let result: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Registers a pseudo plan with one output unless it already exists.
    pub async fn seed_pseudo_plan(&self, name: &PseudoPlanName) -> Result<(), MigrationError> {
        let plan_id = pseudo_plan_id(name);
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT plan_id FROM plan_pseudo WHERE name = $1")
                .bind(name.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Ok(());
        }

        sqlx::query("INSERT INTO plan (plan_id, active) VALUES ($1, TRUE) ON CONFLICT DO NOTHING")
            .bind(&plan_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO plan_pseudo (plan_id, name) VALUES ($1, $2)")
            .bind(&plan_id)
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO output (plan_id, path, is_log) VALUES ($1, $2, FALSE) ON CONFLICT DO NOTHING",
        )
        .bind(&plan_id)
        .bind(PSEUDO_PLAN_OUTPUT_PATH)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(plan_id = %plan_id, name = %name, "seeded pseudo plan");

        Ok(())
    }

    /// Returns a list of applied migrations.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_migrations_table().await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY applied_at, id")
                .fetch_all(&self.pool)
                .await?;

        Ok(migrations)
    }
}

/// Stable plan id of a seeded pseudo plan.
pub fn pseudo_plan_id(name: &PseudoPlanName) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_str().as_bytes()).to_string()
}

/// Record of an applied migration.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}
