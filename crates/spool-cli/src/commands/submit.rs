//! Submit command - submit a generation request.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use spool_core::TaskId;
use spool_flow::engine::TaskOutcome;
use spool_flow::request::GenerationRequest;

use crate::{Config, OutputFormat};

/// Arguments for the submit command.
#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Prompt text.
    #[arg()]
    pub prompt: String,

    /// Provider selector (`openai`, `anthropic` or `echo`).
    #[arg(long, short = 'p', default_value = "echo")]
    pub provider: String,

    /// Model; defaults to the provider's default model.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Sampling temperature.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Caller-chosen task ID.
    #[arg(long)]
    pub task_id: Option<TaskId>,

    /// Run workers in this process and wait for the result.
    #[arg(long, short = 'w')]
    pub wait: bool,

    /// Poll interval when waiting (in milliseconds).
    #[arg(long, default_value = "200")]
    pub poll_interval_ms: u64,
}

impl SubmitArgs {
    fn request(&self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.prompt.clone(), self.provider.clone());
        request.task_id = self.task_id;
        request.model.clone_from(&self.model);
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request
    }
}

/// Execute the submit command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened, the request is rejected,
/// or (with `--wait`) the task does not complete.
pub async fn execute(args: SubmitArgs, config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let receipt = engine
        .submit(args.request())
        .await
        .context("Submission rejected")?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&receipt).context("Failed to serialize response")?
            );
        }
        OutputFormat::Text | OutputFormat::Table => {
            if receipt.cache_hit {
                println!("Served from cache");
            } else if receipt.joined {
                println!("Joined identical in-flight task");
            } else {
                println!("Task submitted");
            }
            println!();
            println!("  Task ID: {}", receipt.task_id);
            if let Some(result) = &receipt.result {
                println!();
                println!("{result}");
            }
        }
    }

    if args.wait && receipt.result.is_none() {
        let pool = engine.worker_pool().spawn();
        let outcome = engine
            .wait_for_outcome(&receipt.task_id, Duration::from_millis(args.poll_interval_ms))
            .await;
        pool.shutdown().await;

        match outcome? {
            TaskOutcome::Completed { text } => {
                if matches!(config.format, OutputFormat::Json) {
                    println!("{}", serde_json::json!({ "result": text }));
                } else {
                    println!();
                    println!("{text}");
                }
            }
            TaskOutcome::Failed { error } => {
                let reason = error.map_or_else(|| "unknown error".to_string(), |e| e.message);
                anyhow::bail!("Task failed: {reason}");
            }
            TaskOutcome::Cancelled { cursor } => {
                anyhow::bail!("Task cancelled after {cursor} chunks");
            }
        }
    }

    Ok(())
}
