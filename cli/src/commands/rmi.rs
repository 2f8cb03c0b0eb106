//! `strata rmi` command: remove one or more images from the store.
//!
//! Cached layers are left alone; `strata cache prune` reclaims them.

use clap::Args;
use strata_core::StrataConfig;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that are not present
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, config: &StrataConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;

    let mut errors: Vec<String> = Vec::new();
    for reference in &args.images {
        match store.remove(&super::store_key(reference)).await {
            Ok(()) => println!("Removed: {reference}"),
            Err(_) if args.force => continue,
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("Failed to remove image(s):\n{}", errors.join("\n")).into())
    }
}
