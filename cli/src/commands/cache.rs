//! `strata cache` commands: inspect and prune the layer cache.

use std::time::Duration;

use clap::Subcommand;
use strata_core::StrataConfig;

use crate::output;

/// Layers used this recently may belong to a running build and are kept by
/// a size-limited prune. `--all` ignores it.
const PRUNE_GRACE: Duration = Duration::from_secs(15 * 60);

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cached layers
    Ls {
        /// Only show cache keys
        #[arg(short, long)]
        quiet: bool,
    },
    /// Evict least-recently-used layers until the cache fits a size limit
    Prune {
        /// Size limit (e.g., "500m", "10g"; default: cache_max_bytes from config)
        #[arg(long, value_parser = output::parse_size_bytes)]
        max_size: Option<u64>,

        /// Remove every cached layer, including ones a running build may be using
        #[arg(short, long, conflicts_with = "max_size")]
        all: bool,
    },
}

pub async fn execute(
    command: CacheCommand,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = super::open_layer_cache(config)?;

    match command {
        CacheCommand::Ls { quiet } => {
            let mut layers = cache.list()?;
            layers.sort_by(|a, b| b.layer.created.cmp(&a.layer.created));

            if quiet {
                for cached in &layers {
                    println!("{}", cached.layer.key);
                }
                return Ok(());
            }

            let mut table = output::new_table(&["KEY", "STEP", "SIZE", "CREATED", "INSTRUCTION"]);
            for cached in &layers {
                table.add_row([
                    cached.layer.key.short().to_string(),
                    cached.layer.kind.to_string(),
                    output::format_bytes(cached.layer.size),
                    output::format_ago(&cached.layer.created),
                    cached.layer.instruction.clone(),
                ]);
            }
            println!("{table}");

            let total: u64 = layers.iter().map(|l| l.layer.size).sum();
            println!(
                "\n{} layer(s), {} total",
                layers.len(),
                output::format_bytes(total)
            );
        }
        CacheCommand::Prune { max_size, all } => {
            let before = cache.total_size()?;
            let evicted = if all {
                cache.prune(0)?
            } else {
                cache.prune_idle(max_size.unwrap_or(config.cache_max_bytes), PRUNE_GRACE)?
            };
            let after = cache.total_size()?;
            println!(
                "Evicted {} layer(s), reclaimed {}",
                evicted,
                output::format_bytes(before.saturating_sub(after))
            );
        }
    }
    Ok(())
}
