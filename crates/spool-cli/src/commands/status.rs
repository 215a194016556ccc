//! Status command - show a task's status.

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;

use spool_core::TaskId;

use super::format_status_colored;
use crate::{Config, OutputFormat};

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Task ID to check.
    #[arg()]
    pub task_id: TaskId,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the task is unknown.
pub async fn execute(args: StatusArgs, config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let report = engine
        .get_status(&args.task_id)
        .await
        .with_context(|| format!("Failed to load task {}", args.task_id))?;

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("Task: {}", report.task_id);
            println!("Status: {}", format_status_colored(report.status));
            match report.total_chunks {
                Some(total) => println!("Chunks: {}/{total}", report.cursor),
                None => println!("Chunks: {}", report.cursor),
            }
            if report.cache_hit {
                println!("Served from cache");
            }
            println!("Updated: {}", report.updated_at);
            if let Some(error) = &report.error {
                let step = error
                    .step
                    .map_or(String::new(), |s| format!(" during {s}"));
                println!(
                    "Error{step} after {} attempt(s): {}",
                    error.attempts,
                    error.message.red()
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_args_parsing() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: StatusArgs,
        }

        let cli = TestCli::parse_from(["test", "01ARZ3NDEKTSV4RRFFQ69G5FAV"]);
        assert_eq!(cli.args.task_id.to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert!(TestCli::try_parse_from(["test", "not-a-ulid"]).is_err());
    }
}
