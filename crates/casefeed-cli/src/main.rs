use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use casefeed_core::Scope;
use casefeed_pipeline::{build_scheduler, Pipeline, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "casefeed")]
#[command(about = "Incremental case-feed ingestion and active-case estimation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    States,
    Counties,
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::States => Scope::States,
            ScopeArg::Counties => Scope::Counties,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Re-read a scope's live feed in full and upsert per-entity snapshots.
    IngestLive {
        #[arg(long, value_enum)]
        scope: ScopeArg,
    },
    /// Ingest the unconsumed tail of a scope's historical feed.
    IngestHistorical {
        #[arg(long, value_enum)]
        scope: ScopeArg,
    },
    /// Recompute active-case estimates for every entity in a scope.
    ComputeActive {
        #[arg(long, value_enum)]
        scope: ScopeArg,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let pipeline = Pipeline::from_config(&config)?;

    match cli.command {
        Commands::IngestLive { scope } => {
            let summary = pipeline.ingest_live(scope.into()).await?;
            println!(
                "live ingestion complete: run_id={} scope={} upserted={} skipped={}",
                summary.run_id, summary.scope, summary.upserted, summary.skipped
            );
        }
        Commands::IngestHistorical { scope } => {
            let summary = pipeline.ingest_historical(scope.into()).await?;
            println!(
                "historical ingestion complete: run_id={} scope={} rows={} offset={}",
                summary.run_id,
                summary.scope,
                summary.rows,
                summary.committed_offset.unwrap_or_default()
            );
        }
        Commands::ComputeActive { scope } => {
            let summary = pipeline.compute_active(scope.into()).await?;
            println!(
                "estimation complete: run_id={} scope={} computed={} failed={}",
                summary.run_id, summary.scope, summary.computed, summary.failed
            );
        }
        Commands::Schedule => {
            let mut scheduler_config = config.clone();
            scheduler_config.scheduler_enabled = true;
            let scheduler = build_scheduler(Arc::new(pipeline), &scheduler_config)
                .await?
                .expect("scheduler enabled above");
            scheduler.start().await.context("starting scheduler")?;
            info!(
                ingest_cron = %scheduler_config.ingest_cron,
                compute_cron = %scheduler_config.compute_cron,
                "scheduler running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
