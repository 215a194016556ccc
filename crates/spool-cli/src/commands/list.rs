//! List command - show recent tasks.

use anyhow::{Context, Result};
use clap::Args;

use super::format_status_colored;
use crate::{Config, OutputFormat};

/// Arguments for the list command.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Maximum tasks to show.
    #[arg(long, short = 'n', default_value = "20")]
    pub limit: usize,
}

/// Execute the list command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the registry cannot be
/// read.
pub async fn execute(args: ListArgs, config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let reports = engine
        .list_tasks(args.limit)
        .await
        .context("Failed to list tasks")?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "tasks": reports,
                    "total": reports.len(),
                }))?
            );
        }
        OutputFormat::Text => {
            if reports.is_empty() {
                println!("No tasks");
            }
            for report in &reports {
                println!(
                    "{}  {:<12}  {}",
                    report.task_id,
                    format_status_colored(report.status),
                    progress(report.cursor, report.total_chunks)
                );
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TaskRow {
                #[tabled(rename = "Task")]
                task_id: String,
                #[tabled(rename = "Status")]
                status: String,
                #[tabled(rename = "Chunks")]
                chunks: String,
                #[tabled(rename = "Cached")]
                cached: bool,
                #[tabled(rename = "Updated")]
                updated: String,
            }

            let rows: Vec<_> = reports
                .iter()
                .map(|r| TaskRow {
                    task_id: r.task_id.to_string(),
                    status: r.status.to_string(),
                    chunks: progress(r.cursor, r.total_chunks),
                    cached: r.cache_hit,
                    updated: r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

fn progress(cursor: u64, total: Option<u64>) -> String {
    total.map_or_else(|| cursor.to_string(), |total| format!("{cursor}/{total}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_args_default_limit() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: ListArgs,
        }

        assert_eq!(TestCli::parse_from(["test"]).args.limit, 20);
        assert_eq!(TestCli::parse_from(["test", "-n", "5"]).args.limit, 5);
    }

    #[test]
    fn test_progress_formatting() {
        assert_eq!(progress(1, Some(3)), "1/3");
        assert_eq!(progress(0, None), "0");
    }
}
