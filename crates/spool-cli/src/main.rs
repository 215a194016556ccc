//! Spool CLI - Command-line interface for the generation engine.
//!
//! The main entry point for the `spool` CLI binary.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spool_cli::{Cli, Commands};
use spool_core::{LogFormat, init_logging};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config();

    // Workers log like a service; one-shot commands keep stdout for output.
    if matches!(cli.command, Commands::Work(_)) {
        init_logging(if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        });
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .init();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Submit(args) => spool_cli::commands::submit::execute(args, &config).await,
            Commands::Batch(args) => spool_cli::commands::batch::execute(args, &config).await,
            Commands::List(args) => spool_cli::commands::list::execute(args, &config).await,
            Commands::Status(args) => spool_cli::commands::status::execute(args, &config).await,
            Commands::Chunks(args) => spool_cli::commands::chunks::execute(args, &config).await,
            Commands::Cancel(args) => spool_cli::commands::cancel::execute(args, &config).await,
            Commands::Stats => spool_cli::commands::stats::execute(&config).await,
            Commands::Sweep => spool_cli::commands::stats::sweep(&config).await,
            Commands::Work(args) => spool_cli::commands::work::execute(args, &config).await,
        }
    })
}
