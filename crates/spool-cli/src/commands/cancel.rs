//! Cancel command - request cancellation of a task.

use anyhow::{Context, Result};
use clap::Args;

use spool_core::TaskId;

use crate::{Config, OutputFormat};

/// Arguments for the cancel command.
#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Task ID to cancel.
    #[arg()]
    pub task_id: TaskId,
}

/// Execute the cancel command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the task is unknown.
pub async fn execute(args: CancelArgs, config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let ack = engine
        .cancel(&args.task_id)
        .await
        .with_context(|| format!("Failed to cancel task {}", args.task_id))?;

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ack)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            if ack.accepted {
                println!("Cancellation requested");
                println!("  No chunk at or past sequence {} will be written", ack.fence);
            } else {
                println!("Task already finished with {} chunks", ack.fence);
            }
        }
    }

    Ok(())
}
