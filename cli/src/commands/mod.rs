//! CLI command definitions and dispatch.

mod build;
mod cache;
mod check;
mod images;
mod import;
mod inspect;
mod lint;
mod rmi;
mod run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use strata_core::StrataConfig;
use strata_runtime::{ImageReference, ImageStore, LayerCache};

/// strata: build container images with dependency-aware layer caching.
#[derive(Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: $STRATA_HOME/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Never contact a registry
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Load configuration, with command-line overrides applied.
    pub fn load_config(&self) -> Result<StrataConfig, Box<dyn std::error::Error>> {
        let mut config = StrataConfig::load(self.config.as_deref())?;
        if self.offline {
            config.offline = true;
        }
        Ok(config)
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a build file
    Build(build::BuildArgs),
    /// Check a build file for cache-hostile ordering and ambiguities
    Lint(lint::LintArgs),
    /// Register a local OCI image layout under a reference
    Import(import::ImportArgs),
    /// List images in the local store
    Images(images::ImagesArgs),
    /// Display image metadata as JSON
    Inspect(inspect::InspectArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
    /// Manage the layer cache
    #[command(subcommand)]
    Cache(cache::CacheCommand),
    /// Verify that an image's entrypoint can start
    Check(check::CheckArgs),
    /// Start a container from an image and wait for it to exit
    Run(run::RunArgs),
}

/// Open the shared image store.
pub(crate) fn open_image_store(
    config: &StrataConfig,
) -> Result<Arc<ImageStore>, Box<dyn std::error::Error>> {
    let store = ImageStore::new(&config.store_dir(), config.store_max_bytes)?;
    Ok(Arc::new(store))
}

/// Open the shared layer cache.
pub(crate) fn open_layer_cache(
    config: &StrataConfig,
) -> Result<Arc<LayerCache>, Box<dyn std::error::Error>> {
    let cache = LayerCache::new(&config.cache_dir())?;
    Ok(Arc::new(cache))
}

/// Key an image is stored under: the normalized reference, or the input
/// as given when it does not parse (digests, odd names).
pub(crate) fn store_key(reference: &str) -> String {
    ImageReference::parse(reference)
        .map(|r| r.full_reference())
        .unwrap_or_else(|_| reference.to_string())
}

/// Resolve `path` against `base` unless it is absolute.
pub(crate) fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, &config).await,
        Command::Lint(args) => lint::execute(args).await,
        Command::Import(args) => import::execute(args, &config).await,
        Command::Images(args) => images::execute(args, &config).await,
        Command::Inspect(args) => inspect::execute(args, &config).await,
        Command::Rmi(args) => rmi::execute(args, &config).await,
        Command::Cache(cmd) => cache::execute(cmd, &config).await,
        Command::Check(args) => check::execute(args, &config).await,
        Command::Run(args) => run::execute(args, &config).await,
    }
}
