//! Chunks command - read a task's chunks.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use spool_core::TaskId;

use crate::{Config, OutputFormat};

/// Arguments for the chunks command.
#[derive(Debug, Args)]
pub struct ChunksArgs {
    /// Task ID to read.
    #[arg()]
    pub task_id: TaskId,

    /// First sequence number to return.
    #[arg(long, default_value = "0")]
    pub from: u64,

    /// Maximum chunks to return.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Keep reading until the task is terminal.
    #[arg(long, short = 'f')]
    pub follow: bool,

    /// Poll interval when following (in milliseconds).
    #[arg(long, default_value = "200")]
    pub poll_interval_ms: u64,
}

/// Execute the chunks command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the task is unknown.
pub async fn execute(args: ChunksArgs, config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let mut from = args.from;

    loop {
        let page = match args.limit {
            Some(limit) => engine.get_chunks_limited(&args.task_id, from, limit).await,
            None => engine.get_chunks(&args.task_id, from).await,
        }
        .with_context(|| format!("Failed to read chunks of task {}", args.task_id))?;

        match config.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&page)?);
            }
            OutputFormat::Text => {
                for chunk in &page.chunks {
                    print!("{}", chunk.payload);
                }
                let _ = io::stdout().flush();
            }
            OutputFormat::Table => {
                use tabled::{Table, Tabled};

                #[derive(Tabled)]
                struct ChunkRow {
                    #[tabled(rename = "Seq")]
                    sequence: u64,
                    #[tabled(rename = "Payload")]
                    payload: String,
                    #[tabled(rename = "Produced")]
                    produced: String,
                }

                let rows: Vec<_> = page
                    .chunks
                    .iter()
                    .map(|c| ChunkRow {
                        sequence: c.sequence,
                        payload: format!("{:?}", c.payload),
                        produced: c.produced_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                    })
                    .collect();
                if !rows.is_empty() {
                    println!("{}", Table::new(rows));
                }
            }
        }

        from += page.chunks.len() as u64;
        if page.done || !args.follow || args.limit.is_some() {
            if matches!(config.format, OutputFormat::Text) {
                println!();
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(args.poll_interval_ms)).await;
    }
}
