//! `strata run` command: start a container and wait for it to exit.

use clap::Args;
use strata_core::StrataConfig;
use strata_runtime::{ContainerRuntime, LocalRuntime};

#[derive(Args)]
pub struct RunArgs {
    /// Image reference or manifest digest
    pub image: String,
}

pub async fn execute(args: RunArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;
    let runtime = LocalRuntime::new(store, &config.run_dir());

    let mut handle = runtime.run(&args.image).await?;
    tracing::debug!(id = %handle.id, pid = ?handle.pid(), "Waiting for container");

    let exited = tokio::select! {
        code = handle.wait() => Some(code?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let code = match exited {
        Some(code) => code,
        None => {
            handle.kill().await?;
            130
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
