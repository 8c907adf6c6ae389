use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_storage::PgSurveyStore;
use pulse_sync::{PipelineConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Employee pulse-survey ingestion and sentiment enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once against the configured batch source.
    Sync {
        /// Skip the remote download and read the local batch file.
        #[arg(long)]
        force_local: bool,
        /// Override the local batch path.
        #[arg(long)]
        batch: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the read API and the pipeline trigger.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule,
    /// Print a markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        force_local: false,
        batch: None,
    }) {
        Commands::Sync { force_local, batch } => {
            config.force_local |= force_local;
            if let Some(batch) = batch {
                config.local_batch = batch;
            }
            let pipeline = SyncPipeline::from_config(config).await?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current record");
                    on_signal.cancel();
                }
            });
            let summary = pipeline.run_once_with_cancel(cancel).await?;
            println!(
                "sync complete: run_id={} inserted={} updated={} skipped={} rejected={} enriched={} failed={} reports={}",
                summary.run_id,
                summary.inserted,
                summary.updated,
                summary.skipped,
                summary.rejected,
                summary.enrichment.enriched,
                summary.enrichment.failed,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            let store = PgSurveyStore::connect(&config.database_url, 2).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { bind } => {
            let bind_addr = bind.unwrap_or_else(|| config.bind_addr.clone());
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let mut scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("cron scheduler started alongside the api");
            }
            let state = pulse_web::AppState::new(pipeline.store(), pipeline.config().workspace_root.clone())
                .with_pipeline(pipeline);
            let served = pulse_web::serve(state, &bind_addr).await;
            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            served?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set PULSE_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", pulse_sync::report_markdown(runs, Some(config.workspace_root))?);
        }
    }

    Ok(())
}
