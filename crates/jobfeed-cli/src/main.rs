use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_storage::AcquisitionSource;
use jobfeed_sync::reconcile::{ReconcileMode, ReconcileOutcome};
use jobfeed_sync::tasks::{Task, TaskOutcome};
use jobfeed_sync::SyncRuntime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobfeed-cli")]
#[command(about = "Job feed ingestion and search index reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Acquire a source's feed and reconcile it into the index.
    Sync {
        #[arg(long)]
        source: String,
        /// Download from this URL instead of the source's feed_url.
        #[arg(long, conflicts_with = "archive")]
        url: Option<String>,
        /// Read a local XML file or ZIP archive.
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Only send jobs the index does not have yet.
        #[arg(long)]
        incremental: bool,
    },
    /// Remove a source's non-posted jobs from the index.
    Clear {
        #[arg(long)]
        source: String,
    },
    /// Run the cron refresh until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let runtime = SyncRuntime::from_env().await.context("loading sync configuration")?;

    match cli.command {
        Commands::Sync {
            source,
            url,
            archive,
            incremental,
        } => {
            let acquisition = url
                .map(AcquisitionSource::Url)
                .or(archive.map(AcquisitionSource::Archive));
            let mode = if incremental {
                ReconcileMode::Incremental
            } else {
                ReconcileMode::Force
            };
            let task = Task::Reconcile {
                source_id: source,
                acquisition,
                mode,
            };
            match runtime.runner.run(&task).await? {
                TaskOutcome::Reconciled(ReconcileOutcome::Applied(summary)) => println!(
                    "sync complete: run_id={} source={} upserted={} deleted={} round_trips={}",
                    summary.run_id,
                    summary.source_id,
                    summary.upserted,
                    summary.deleted,
                    summary.round_trips
                ),
                TaskOutcome::Reconciled(ReconcileOutcome::Rejected { source_id, error }) => {
                    eprintln!("feed for {source_id} rejected: {error}");
                    std::process::exit(2);
                }
                other => println!("{other:?}"),
            }
        }
        Commands::Clear { source } => {
            runtime
                .runner
                .run(&Task::ClearSource {
                    source_id: source.clone(),
                })
                .await?;
            println!("cleared {source}");
        }
        Commands::Schedule => {
            let Some(mut sched) = runtime.maybe_build_scheduler().await? else {
                eprintln!("scheduler disabled; set JOBFEED_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %runtime.config.sync_cron, "scheduler running");

            tokio::select! {
                drained = runtime.queue.run(runtime.runner.clone()) => tracing::info!(
                    completed = drained.completed,
                    dead_letters = drained.dead_letters,
                    "task queue closed"
                ),
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for ctrl-c")?;
                    tracing::info!("shutting down");
                }
            }
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
