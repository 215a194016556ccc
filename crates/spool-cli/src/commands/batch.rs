//! Batch command - submit several prompts with shared settings.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use spool_flow::engine::TaskOutcome;
use spool_flow::request::GenerationRequest;

use crate::{Config, OutputFormat};

/// Arguments for the batch command.
#[derive(Debug, Args)]
pub struct BatchArgs {
    /// Prompts to submit, one task each.
    #[arg(required = true)]
    pub prompts: Vec<String>,

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

    /// Run workers in this process until every task settles.
    #[arg(long, short = 'w')]
    pub wait: bool,
}

impl BatchArgs {
    fn requests(&self) -> Vec<GenerationRequest> {
        self.prompts
            .iter()
            .map(|prompt| {
                let mut request = GenerationRequest::new(prompt.clone(), self.provider.clone());
                request.model.clone_from(&self.model);
                request.temperature = self.temperature;
                request.max_tokens = self.max_tokens;
                request
            })
            .collect()
    }
}

/// Execute the batch command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or any request is
/// rejected.
pub async fn execute(args: BatchArgs, config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let receipts = engine
        .submit_batch(args.requests())
        .await
        .context("Batch rejected")?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&receipts)?),
        OutputFormat::Text | OutputFormat::Table => {
            println!("Submitted {} prompt(s)", receipts.len());
            for receipt in &receipts {
                let note = if receipt.cache_hit {
                    " (cached)"
                } else if receipt.joined {
                    " (joined)"
                } else {
                    ""
                };
                println!("  {}{note}", receipt.task_id);
            }
        }
    }

    if args.wait {
        let pool = engine.worker_pool().spawn();
        let mut failed = 0;
        for receipt in &receipts {
            let outcome = engine
                .wait_for_outcome(&receipt.task_id, Duration::from_millis(200))
                .await;
            match outcome {
                Ok(TaskOutcome::Completed { .. }) => {}
                Ok(other) => {
                    failed += 1;
                    tracing::warn!(task_id = %receipt.task_id, outcome = ?other, "task did not complete");
                }
                Err(e) => {
                    pool.shutdown().await;
                    return Err(e).context("Failed to wait for batch");
                }
            }
        }
        pool.shutdown().await;
        if failed > 0 {
            anyhow::bail!("{failed} of {} task(s) did not complete", receipts.len());
        }
        println!("All tasks completed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(clap::Parser)]
    struct TestCli {
        #[command(flatten)]
        args: BatchArgs,
    }

    #[test]
    fn test_batch_args_share_settings() {
        use clap::Parser;

        let cli = TestCli::parse_from(["test", "First", "Second", "--provider", "openai", "--max-tokens", "64"]);
        let requests = cli.args.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].prompt, "Second");
        assert!(requests.iter().all(|r| r.provider == "openai" && r.max_tokens == Some(64)));
    }

    #[test]
    fn test_batch_requires_a_prompt() {
        use clap::Parser;

        assert!(TestCli::try_parse_from(["test"]).is_err());
    }
}
