//! `strata build` command: build and tag an image from a build file.
//!
//! Resolves the base image, runs every step against the layer cache, and
//! stores the result in the local image store. Ctrl-C cancels the build
//! at the next step boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use strata_core::event::events;
use strata_core::StrataConfig;
use strata_runtime::oci::BaseImageResolver;
use strata_runtime::{
    BuildEngine, BuildRequest, ChrootExecutor, CommandExecutor, RegistryAuth, StoreResolver,
};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the build file and sources)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "myapp:latest")
    #[arg(short = 't', long = "tag")]
    pub tag: String,

    /// Path to the build file (default: <PATH>/Stratafile, then <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Ignore cached layers and re-run every step
    #[arg(long)]
    pub no_cache: bool,

    /// Print only the image digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: BuildArgs,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let mut request = BuildRequest::new(&context_dir, &args.tag);
    request.build_file = args
        .file
        .as_deref()
        .map(|f| super::resolve_path(&context_dir, f));
    request.build_args = parse_build_args(&args.build_arg)?;
    request.no_cache = args.no_cache;

    let store = super::open_image_store(config)?;
    let cache = super::open_layer_cache(config)?;
    let resolver: Arc<dyn BaseImageResolver> = if config.offline {
        Arc::new(StoreResolver::offline(store.clone()))
    } else {
        Arc::new(StoreResolver::new(store.clone(), RegistryAuth::from_env()))
    };
    let executor: Arc<dyn CommandExecutor> =
        Arc::new(ChrootExecutor::new(config.executor.clone()));

    let engine = BuildEngine::new(resolver, executor, cache, store)
        .with_ignore(config.ignore.clone());

    let progress = if args.quiet {
        None
    } else {
        let mut stream = engine
            .events()
            .subscribe_filtered(|e| e.key == events::STEP_COMPLETED);
        Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let field = |name: &str| {
                    event
                        .field(name)
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .unwrap_or_default()
                };
                println!(
                    "Step {:>3}  {:<10} {}",
                    field("line"),
                    field("status"),
                    field("instruction")
                );
            }
        }))
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling build...");
            on_interrupt.cancel();
        }
    });

    let result = engine.build(request, cancel).await;
    signal.abort();

    // The engine holds the only sender; dropping it ends the progress stream
    drop(engine);
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    let outcome = result?;
    if args.quiet {
        println!("{}", outcome.image.id);
        return Ok(());
    }

    println!(
        "{} steps, {} cached, {} built",
        outcome.steps.len(),
        outcome.cache_hits(),
        outcome.layers_built()
    );
    println!("Successfully built {}", outcome.image.id);
    println!("Successfully tagged {}", outcome.image.reference);
    Ok(())
}

/// Parse `KEY=VALUE` build arguments.
fn parse_build_args(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid build arg (expected KEY=VALUE): {arg}"))?;
        if key.is_empty() {
            return Err(format!("Invalid build arg (empty name): {arg}"));
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_args_valid() {
        let args = vec!["PYTHON=3.12".to_string(), "DEBUG=true".to_string()];
        let result = parse_build_args(&args).unwrap();
        assert_eq!(result.get("PYTHON"), Some(&"3.12".to_string()));
        assert_eq!(result.get("DEBUG"), Some(&"true".to_string()));
    }

    #[test]
    fn test_parse_build_args_empty() {
        assert!(parse_build_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_build_args_invalid() {
        assert!(parse_build_args(&["NOEQUALS".to_string()]).is_err());
        assert!(parse_build_args(&["=value".to_string()]).is_err());
    }

    #[test]
    fn test_parse_build_args_value_with_equals() {
        let args = vec!["INDEX=https://pypi.org/simple?a=1".to_string()];
        let result = parse_build_args(&args).unwrap();
        assert_eq!(
            result.get("INDEX"),
            Some(&"https://pypi.org/simple?a=1".to_string())
        );
    }
}
