//! Transactional storage for runs, data and nominations.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Port**: the [`Store`] and [`Transaction`] traits the core is written against
//! - **Postgres**: sqlx-backed implementation with row-level locking
//! - **Memory**: in-process implementation with the same locking contract
//! - **Migrations**: schema management and pseudo plan seeding
//!
//! # Usage
//!
//! ```rust,ignore
//! use knitcore::storage::{LockMode, PgStore, Store};
//!
//! let store = PgStore::connect(&config.database).await?;
//! store.run_migrations().await?;
//!
//! let mut tx = store.begin().await?;
//! let locked = tx.lock_runs(&[run_id], LockMode::FailOnContention).await?;
//! tx.commit().await?;
//! ```

pub mod memory;
pub mod migrations;
pub mod port;
pub mod postgres;
pub mod schema;

pub use memory::{MemoryStore, MemoryTransaction, Snapshot};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use port::{
    DataScope, InputScope, LockMode, Locked, NominationScope, StorageError, Store, Transaction,
};
pub use postgres::{PgStore, PgTransaction};
