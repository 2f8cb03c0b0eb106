//! `strata check` command: verify an image's entrypoint can start.
//!
//! Composes the image's root filesystem and resolves the entrypoint the
//! way `strata run` would, without launching anything.

use clap::Args;
use strata_core::StrataConfig;
use strata_runtime::LocalRuntime;

#[derive(Args)]
pub struct CheckArgs {
    /// Image reference or manifest digest
    pub image: String,
}

pub async fn execute(
    args: CheckArgs,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;
    let runtime = LocalRuntime::new(store, &config.run_dir());

    let spec = runtime.prepare(&args.image).await?;

    println!("Image:      {}", spec.image);
    println!("Digest:     {}", spec.digest);
    println!("Entrypoint: {}", spec.argv.join(" "));
    println!("Resolved:   {}", spec.program);
    println!("WorkingDir: {}", spec.workdir);
    if !spec.exposed_ports.is_empty() {
        println!("Ports:      {}", spec.exposed_ports.join(", "));
    }
    println!("OK");
    Ok(())
}
