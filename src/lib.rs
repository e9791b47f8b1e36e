//! knitcore: run lifecycle state machine and nomination matching engine.
//!
//! The crate decides when runs change status, what happens to their output
//! data when they do, and which data items are candidates for which plan
//! inputs. It is written against the [`storage::Store`] port, with a
//! PostgreSQL implementation for production and an in-memory one for tests.

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod nomination;
pub mod storage;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{ErrorKind, LifecycleError, NamingError, NominationError};
pub use storage::StorageError;
