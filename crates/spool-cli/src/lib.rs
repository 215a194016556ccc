//! # spool-cli
//!
//! Command-line interface for a local spool engine.
//!
//! ## Commands
//!
//! - `spool submit` - Submit a generation request
//! - `spool batch` - Submit several prompts at once
//! - `spool list` - Show recent tasks
//! - `spool status` - Show a task's status
//! - `spool chunks` - Read a task's chunks
//! - `spool cancel` - Request cancellation
//! - `spool stats` - Show cache statistics
//! - `spool work` - Run workers against the data directory
//! - `spool sweep` - Delete expired cache entries
//!
//! ## Configuration
//!
//! Engine settings come from the environment (`SPOOL_*`, `OPENAI_API_KEY`,
//! `ANTHROPIC_API_KEY`); the flags below override the data directory and
//! output format.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use spool_flow::config::EngineConfig;
use spool_flow::engine::Engine;

/// Spool - durable, resumable text generation.
#[derive(Debug, Parser)]
#[command(name = "spool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Data directory of the local engine.
    #[arg(long, env = "SPOOL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            data_dir: self.data_dir.clone(),
            format: self.format.clone(),
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Submit a generation request.
    Submit(commands::submit::SubmitArgs),
    /// Submit several prompts with shared settings.
    Batch(commands::batch::BatchArgs),
    /// Show recent tasks, newest first.
    List(commands::list::ListArgs),
    /// Show a task's status.
    Status(commands::status::StatusArgs),
    /// Read a task's chunks.
    Chunks(commands::chunks::ChunksArgs),
    /// Request cancellation of a task.
    Cancel(commands::cancel::CancelArgs),
    /// Show cache statistics.
    Stats,
    /// Delete expired cache entries.
    Sweep,
    /// Run workers until interrupted.
    Work(commands::work::WorkArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Data directory override.
    pub data_dir: Option<PathBuf>,
    /// Output format.
    pub format: OutputFormat,
}

impl Config {
    /// Resolves the engine configuration from the environment and flags.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed environment values.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir.clone_from(dir);
        }
        Ok(config)
    }

    /// Opens the local engine.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or the data directory
    /// cannot be opened.
    pub fn open_engine(&self) -> Result<Engine> {
        let config = self.engine_config()?;
        let dir = config.data_dir.display().to_string();
        Engine::open_local(config).with_context(|| format!("Failed to open data directory {dir}"))
    }
}
