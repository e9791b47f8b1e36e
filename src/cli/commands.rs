//! CLI command definitions for knitcore.
//!
//! Every command opens the configured PostgreSQL store, performs one
//! operation and prints its result as JSON. With `--metrics-file` the
//! metrics recorded by the invocation are written out in the Prometheus
//! text format for a textfile collector to pick up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::domain::{InputId, KnitId, PseudoPlanName, RunExit, RunId};
use crate::lifecycle::{PrefixNamingConvention, RunLifecycle};
use crate::metrics::{export_metrics, init_metrics};
use crate::nomination::{MatchingEngine, Nominator};
use crate::storage::{MigrationRunner, NominationScope, PgStore, Store};

/// Run lifecycle and nomination maintenance for a lineage-aware pipeline store.
#[derive(Parser)]
#[command(name = "knitcore")]
#[command(about = "Drive run lifecycles and data nominations in a knit store")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables are used when absent.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// PostgreSQL connection URL; overrides the configured one.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Write the metrics of this invocation to a file once it ends.
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Apply the schema and seed the system pseudo plans.
    Migrate,

    /// Move a completing run to done, or an aborting run to failed.
    Finish(RunArgs),

    /// Send a done or failed run back to waiting.
    Retry(RunArgs),

    /// Record the exit code and message of a run.
    SetExit(SetExitArgs),

    /// Create a running pseudo run with fresh output data.
    NewPseudo(NewPseudoArgs),

    /// Reconcile the nominations of data items.
    NominateData(KnitIdsArgs),

    /// Reconcile the nominations of inputs against all done data.
    NominateInputs(InputIdsArgs),

    /// Delete every nomination of data items.
    DropData(KnitIdsArgs),

    /// Forget the worker of a run whose workload has ended.
    DeleteWorker(RunArgs),

    /// Show a run with its exit, worker, inputs and outputs.
    ShowRun(RunArgs),

    /// List nominations.
    Nominations(NominationsArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run id.
    pub run_id: String,
}

#[derive(Parser, Debug)]
pub struct SetExitArgs {
    /// Run id.
    pub run_id: String,

    /// Exit code, 0 to 255.
    #[arg(long)]
    pub code: u8,

    /// Exit message.
    #[arg(long, default_value = "")]
    pub message: String,
}

#[derive(Parser, Debug)]
pub struct NewPseudoArgs {
    /// Pseudo plan name, such as knit#uploaded.
    pub plan_name: String,

    /// Lease of the new run in seconds; defaults to the configured value.
    #[arg(long)]
    pub suspend_secs: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct KnitIdsArgs {
    /// Knit ids.
    #[arg(required = true)]
    pub knit_ids: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct InputIdsArgs {
    /// Input ids.
    #[arg(required = true)]
    pub input_ids: Vec<i64>,
}

#[derive(Parser, Debug)]
pub struct NominationsArgs {
    /// Only nominations of these knit ids.
    #[arg(long = "knit-id", conflicts_with = "input_ids")]
    pub knit_ids: Vec<String>,

    /// Only nominations of these input ids.
    #[arg(long = "input-id")]
    pub input_ids: Vec<i64>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "metrics registry unavailable");
    }

    let metrics_file = cli.metrics_file.clone();
    let result = dispatch(cli).await;

    if let Some(path) = metrics_file {
        if let Err(e) = write_metrics_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to write metrics");
        }
    }
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli.config.as_deref(), cli.database_url)?;
    debug!(
        max_connections = config.database.max_connections,
        volume_prefix = %config.naming.volume_prefix,
        "configuration loaded"
    );
    let store = PgStore::connect(&config.database)
        .await
        .context("connecting to the database")?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&store).await,
        Commands::Finish(args) => {
            let transition = lifecycle(&store, &config).finish(&RunId(args.run_id)).await?;
            print_json(&transition)
        }
        Commands::Retry(args) => {
            let outcome = lifecycle(&store, &config).retry(&RunId(args.run_id)).await?;
            print_json(&outcome)
        }
        Commands::SetExit(args) => {
            let run_id = RunId(args.run_id);
            let exit = RunExit {
                code: args.code,
                message: args.message,
            };
            lifecycle(&store, &config).set_exit(&run_id, &exit).await?;
            print_json(&serde_json::json!({ "run_id": run_id, "exit": exit }))
        }
        Commands::NewPseudo(args) => {
            let plan_name = PseudoPlanName::new(args.plan_name.clone())
                .with_context(|| format!("'{}' is not a pseudo plan name", args.plan_name))?;
            let suspend = args
                .suspend_secs
                .map(Duration::from_secs)
                .unwrap_or(config.pseudo_lifecycle_suspend);

            let lifecycle = lifecycle(&store, &config);
            let run_id = lifecycle.new_pseudo(&plan_name, suspend).await?;
            print_json(&lifecycle.get(&run_id).await?)
        }
        Commands::NominateData(args) => {
            let knit_ids: Vec<KnitId> = args.knit_ids.into_iter().map(KnitId).collect();
            run_nomination_command(&store, NominationCommand::Data(&knit_ids)).await
        }
        Commands::NominateInputs(args) => {
            let input_ids: Vec<InputId> = args.input_ids.into_iter().map(InputId).collect();
            run_nomination_command(&store, NominationCommand::Inputs(&input_ids)).await
        }
        Commands::DropData(args) => {
            let knit_ids: Vec<KnitId> = args.knit_ids.into_iter().map(KnitId).collect();
            run_nomination_command(&store, NominationCommand::Drop(&knit_ids)).await
        }
        Commands::DeleteWorker(args) => {
            let run_id = RunId(args.run_id);
            let existed = lifecycle(&store, &config).delete_worker(&run_id).await?;
            print_json(&serde_json::json!({ "run_id": run_id, "deleted": existed }))
        }
        Commands::ShowRun(args) => {
            let detail = lifecycle(&store, &config).get(&RunId(args.run_id)).await?;
            print_json(&detail)
        }
        Commands::Nominations(args) => run_nominations_command(&store, args).await,
    }
}

/// Replaces `path` with the current registry contents.
///
/// The text goes to a sibling temporary file first, so a collector never
/// reads a partial write.
fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut staged, export_metrics().as_bytes())?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Loads the YAML file if one is given, else the environment, then applies
/// the URL override.
fn resolve_config(path: Option<&Path>, database_url: Option<String>) -> anyhow::Result<CoreConfig> {
    let mut config = match path {
        Some(path) => CoreConfig::read_yaml_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut config = CoreConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(url) = database_url {
        config.database.url = url;
    }
    config.validate()?;
    Ok(config)
}

fn lifecycle(store: &PgStore, config: &CoreConfig) -> RunLifecycle {
    let naming = PrefixNamingConvention::new(
        config.naming.volume_prefix.clone(),
        config.naming.worker_prefix.clone(),
    );
    RunLifecycle::new(Arc::new(store.clone())).with_naming(Arc::new(naming))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_migrate_command(store: &PgStore) -> anyhow::Result<()> {
    store.run_migrations().await?;

    let applied = MigrationRunner::new(store.pool().clone())
        .list_applied_migrations()
        .await?;
    info!(count = applied.len(), "schema is up to date");
    print_json(&applied)
}

#[derive(Clone, Copy)]
enum NominationCommand<'a> {
    Data(&'a [KnitId]),
    Inputs(&'a [InputId]),
    Drop(&'a [KnitId]),
}

async fn run_nomination_command(
    store: &PgStore,
    command: NominationCommand<'_>,
) -> anyhow::Result<()> {
    let engine = MatchingEngine::new();
    let mut tx = store.begin().await?;

    let outcome = match command {
        NominationCommand::Data(ids) => engine.nominate_data(tx.as_mut(), ids).await,
        NominationCommand::Inputs(ids) => engine.nominate_mountpoints(tx.as_mut(), ids).await,
        NominationCommand::Drop(ids) => engine.drop_data(tx.as_mut(), ids).await,
    };
    if let Err(e) = outcome {
        tx.rollback().await?;
        return Err(e.into());
    }

    let scope = match command {
        NominationCommand::Data(ids) | NominationCommand::Drop(ids) => {
            NominationScope::KnitIds(ids)
        }
        NominationCommand::Inputs(ids) => NominationScope::InputIds(ids),
    };
    let nominations = engine.list(tx.as_mut(), scope).await?;
    tx.commit().await?;

    print_json(&nominations)
}

async fn run_nominations_command(store: &PgStore, args: NominationsArgs) -> anyhow::Result<()> {
    let knit_ids: Vec<KnitId> = args.knit_ids.into_iter().map(KnitId).collect();
    let input_ids: Vec<InputId> = args.input_ids.into_iter().map(InputId).collect();
    let scope = if !knit_ids.is_empty() {
        NominationScope::KnitIds(&knit_ids)
    } else if !input_ids.is_empty() {
        NominationScope::InputIds(&input_ids)
    } else {
        NominationScope::All
    };

    let mut tx = store.begin().await?;
    let nominations = MatchingEngine::new().list(tx.as_mut(), scope).await?;
    tx.rollback().await?;

    print_json(&nominations)
}
