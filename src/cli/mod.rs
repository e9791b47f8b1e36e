//! Command-line interface for knitcore.
//!
//! Provides commands for schema migration, run lifecycle operations and
//! nomination maintenance.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
