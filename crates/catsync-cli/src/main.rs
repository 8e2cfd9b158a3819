use std::sync::Arc;

use anyhow::{Context, Result};
use catsync_core::{RunStatus, SyncOutcome};
use catsync_storage::PgSnapshotStore;
use catsync_sync::{Orchestrator, SyncConfig};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Catalogue synchronization engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Owner of the catalogue rows to process.
    #[arg(long)]
    user: String,
    /// Snapshot date (YYYY-MM-DD); each pass picks its own default when omitted.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full run: streams, playlist followers, catalogue health.
    Sync(RunArgs),
    Streams(RunArgs),
    Followers(RunArgs),
    HealthCheck(RunArgs),
    /// Apply database migrations.
    Migrate,
    /// Start the HTTP front door and the scheduler.
    Serve,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn connect(config: &SyncConfig) -> Result<PgSnapshotStore> {
    PgSnapshotStore::connect(&config.database_url)
        .await
        .context("connecting to database")
}

fn report(outcome: &SyncOutcome) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(outcome).context("serializing outcome")?
    );
    if outcome.status == RunStatus::Failed {
        anyhow::bail!(
            "run for {} failed: {}",
            outcome.user_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            info!("migrations complete");
        }
        Commands::Serve => catsync_web::serve(config).await?,
        Commands::Sync(args) => {
            let orchestrator = Orchestrator::from_config(&config, Arc::new(connect(&config).await?))?;
            report(&orchestrator.synchronize(&args.user, args.date).await?)?;
        }
        Commands::Streams(args) => {
            let orchestrator = Orchestrator::from_config(&config, Arc::new(connect(&config).await?))?;
            report(&orchestrator.run_streams(&args.user, args.date).await?)?;
        }
        Commands::Followers(args) => {
            let orchestrator = Orchestrator::from_config(&config, Arc::new(connect(&config).await?))?;
            report(&orchestrator.run_followers(&args.user, args.date).await?)?;
        }
        Commands::HealthCheck(args) => {
            let orchestrator = Orchestrator::from_config(&config, Arc::new(connect(&config).await?))?;
            report(&orchestrator.run_health_check(&args.user, args.date).await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::parse_from(["catsync", "health-check", "--user", "u1", "--date", "2026-03-01"]);
        match cli.command {
            Commands::HealthCheck(args) => {
                assert_eq!(args.user, "u1");
                assert_eq!(args.date, NaiveDate::from_ymd_opt(2026, 3, 1));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
