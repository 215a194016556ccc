//! Stats and sweep commands - cache maintenance.

use anyhow::{Context, Result};

use crate::{Config, OutputFormat};

/// Execute the stats command.
///
/// Hit, miss and eviction counters are per process, so a fresh CLI process
/// reports only the stored entry count meaningfully.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the cache is
/// unreadable.
pub async fn execute(config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let stats = engine
        .cache_stats()
        .await
        .context("Failed to read cache statistics")?;

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("Cache:");
            println!("  Entries:   {}", stats.entries);
            println!("  Hits:      {}", stats.hits);
            println!("  Misses:    {}", stats.misses);
            println!("  Evictions: {}", stats.evictions);
        }
    }

    Ok(())
}

/// Execute the sweep command.
///
/// # Errors
///
/// Returns an error if the engine cannot be opened or the cache is
/// unreadable.
pub async fn sweep(config: &Config) -> Result<()> {
    let engine = config.open_engine()?;
    let removed = engine
        .sweep_cache()
        .await
        .context("Failed to sweep cache")?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
        OutputFormat::Text | OutputFormat::Table => {
            println!("Removed {removed} expired cache entries");
        }
    }

    Ok(())
}
