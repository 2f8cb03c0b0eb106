//! `strata inspect` command: display image metadata as JSON.

use clap::Args;
use strata_core::StrataConfig;
use strata_runtime::OciImage;

#[derive(Args)]
pub struct InspectArgs {
    /// Image reference or manifest digest
    pub image: String,
}

pub async fn execute(
    args: InspectArgs,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;

    let stored = match store.get(&super::store_key(&args.image)).await {
        Some(stored) => stored,
        None => store
            .get_by_digest(&args.image)
            .await
            .ok_or_else(|| format!("Image not found: {}", args.image))?,
    };

    let oci = OciImage::from_path(&stored.path)?;
    let config = oci.config();

    let env: serde_json::Map<String, serde_json::Value> = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();

    let layers: Vec<serde_json::Value> = oci
        .layers()
        .iter()
        .map(|layer| {
            serde_json::json!({
                "Digest": layer.digest,
                "DiffId": layer.diff_id,
                "Size": layer.size,
            })
        })
        .collect();

    let history: Vec<serde_json::Value> = config
        .history
        .iter()
        .map(|h| {
            serde_json::json!({
                "CreatedBy": h.created_by,
                "EmptyLayer": h.empty_layer,
            })
        })
        .collect();

    let output = serde_json::json!({
        "Reference": stored.reference,
        "Digest": stored.digest,
        "Size": stored.size_bytes,
        "Source": stored.source,
        "Stored": stored.created_at.to_rfc3339(),
        "Created": config.created,
        "Config": {
            "Entrypoint": config.entrypoint,
            "Cmd": config.cmd,
            "Env": env,
            "WorkingDir": config.working_dir,
            "ExposedPorts": config.exposed_ports,
            "Labels": config.labels,
        },
        "Layers": layers,
        "History": history,
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
