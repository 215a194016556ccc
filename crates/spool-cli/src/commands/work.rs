//! Work command - run workers against the data directory.

use anyhow::{Context, Result};
use clap::Args;

use spool_core::WorkerId;

use crate::{Config, OutputFormat};

/// Arguments for the work command.
#[derive(Debug, Args)]
pub struct WorkArgs {
    /// Drain the active tasks once and exit instead of running forever.
    #[arg(long)]
    pub once: bool,

    /// Number of worker loops; overrides `SPOOL_WORKER_COUNT`.
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Execute the work command.
///
/// The first scan of every worker resumes tasks left behind by crashed
/// processes.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the active index is
/// unreadable.
pub async fn execute(args: WorkArgs, config: &Config) -> Result<()> {
    let mut engine_config = config.engine_config()?;
    if let Some(workers) = args.workers {
        engine_config.worker_count = workers;
    }
    let dir = engine_config.data_dir.display().to_string();
    let engine = spool_flow::engine::Engine::open_local(engine_config)
        .with_context(|| format!("Failed to open data directory {dir}"))?;

    if args.once {
        let report = engine
            .worker_pool()
            .drain(&WorkerId::generate("cli"))
            .await
            .context("Failed to scan active tasks")?;
        match config.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "seen": report.seen,
                    "settled": report.settled,
                    "busy": report.busy,
                    "interrupted": report.interrupted,
                })
            ),
            OutputFormat::Text | OutputFormat::Table => println!(
                "Settled {} of {} active tasks ({} busy elsewhere, {} interrupted)",
                report.settled, report.seen, report.busy, report.interrupted
            ),
        }
        return Ok(());
    }

    let pool = engine.worker_pool().spawn();
    tracing::info!(data_dir = %dir, "workers running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    pool.shutdown().await;
    Ok(())
}
