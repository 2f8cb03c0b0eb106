//! `strata import` command: register a local OCI image layout.
//!
//! Imported images resolve as base images without any registry access,
//! which is how offline builds get their bases.

use clap::Args;
use strata_core::StrataConfig;
use strata_runtime::{ImageReference, StoreResolver};

use crate::output;

#[derive(Args)]
pub struct ImportArgs {
    /// Directory holding an OCI image layout (oci-layout, index.json, blobs/)
    pub layout: String,

    /// Reference to register the image under (e.g., "python:3.12-slim")
    pub reference: String,
}

pub async fn execute(
    args: ImportArgs,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.reference)?;
    let store = super::open_image_store(config)?;
    let resolver = StoreResolver::offline(store);

    let stored = resolver
        .import(std::path::Path::new(&args.layout), &reference)
        .await?;

    println!(
        "Imported {} {} ({})",
        stored.reference,
        output::short_digest(&stored.digest),
        output::format_bytes(stored.size_bytes)
    );
    Ok(())
}
