//! XRegion CLI - Command line interface for cross-region sync runs.
//!
//! This tool resolves sync jobs from a YAML configuration file and either
//! runs them or reports which of them need a copy. Resources live in a JSON
//! state file served by the in-memory provider.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use xregion_provider::{create_default_registry, MemoryCloud};
use xregion_sync::{Operation, RunnerConfig, SyncOutcome};

#[derive(Parser)]
#[command(name = "xregion")]
#[command(about = "XRegion - Cross-region image and snapshot sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(clap::Args)]
struct RunArgs {
    /// YAML file describing the sync jobs.
    #[arg(short, long)]
    config: PathBuf,

    /// JSON state file holding the cloud resources.
    #[arg(short, long)]
    state: PathBuf,

    /// Number of jobs run at the same time.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Print outcomes as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every out-of-date resource and apply retention.
    Sync {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Report which jobs need a copy without changing anything.
    Check {
        #[command(flatten)]
        args: RunArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let outcomes = match cli.command {
        Commands::Sync { args } => cmd_run(&args, Operation::Sync).await?,
        Commands::Check { args } => cmd_run(&args, Operation::Check).await?,
    };

    if outcomes.iter().any(SyncOutcome::is_failed) {
        std::process::exit(1);
    }
    Ok(())
}

/// Run `operation` over every configured job and print the outcomes.
async fn cmd_run(args: &RunArgs, operation: Operation) -> Result<Vec<SyncOutcome>> {
    let cloud = Arc::new(load_cloud(&args.state).await?);
    let registry =
        Arc::new(create_default_registry(cloud.clone()).context("Failed to create registry")?);

    let runner_config = RunnerConfig {
        concurrency: args.concurrency,
    };
    let outcomes = xregion_sync::run(&args.config, registry, operation, runner_config)
        .await
        .with_context(|| format!("Failed to load sync jobs from {}", args.config.display()))?;

    if operation == Operation::Sync {
        cloud
            .save(&args.state)
            .await
            .with_context(|| format!("Failed to save state to {}", args.state.display()))?;
        info!("State saved to {}", args.state.display());
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcomes).context("Failed to encode outcomes")?
        );
    } else {
        print_outcomes(&outcomes);
    }

    Ok(outcomes)
}

async fn load_cloud(path: &Path) -> Result<MemoryCloud> {
    if !path.exists() {
        info!("No state file at {}, starting empty", path.display());
        return Ok(MemoryCloud::new());
    }
    MemoryCloud::load(path)
        .await
        .with_context(|| format!("Failed to load state from {}", path.display()))
}

fn print_outcomes(outcomes: &[SyncOutcome]) {
    for outcome in outcomes {
        if outcome.is_failed() {
            println!("{}: FAILED", outcome.name);
            for error in &outcome.errors {
                println!("  {}", error);
            }
        } else if let Some(required) = outcome.sync_required {
            let status = if required { "sync required" } else { "up to date" };
            println!("{}: {}", outcome.name, status);
        } else if let Some(id) = &outcome.created_resource_id {
            println!("{}: created {}", outcome.name, id);
        } else {
            println!("{}: up to date", outcome.name);
        }
    }

    let failed = outcomes.iter().filter(|o| o.is_failed()).count();
    println!("\n{} job(s), {} failed", outcomes.len(), failed);
}
