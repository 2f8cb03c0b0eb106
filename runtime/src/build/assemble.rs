//! Image assembly: base layers plus built layers into a tagged OCI layout.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use strata_core::error::{Result, StrataError};

use super::entrypoint::ImageConfig;
use super::layer::diff_id_of;
use crate::cache::CachedLayer;
use crate::oci::layout::{write_layout, LayoutLayer};
use crate::oci::{BaseImage, HistoryRecord, ImageReference, ImageSource, ImageStore, StoredImage};

/// Everything that goes into the final image.
pub struct Assembly<'a> {
    pub base: &'a BaseImage,
    /// Layers built (or reused) on top of the base, bottom to top
    pub layers: &'a [CachedLayer],
    pub config: &'a ImageConfig,
    /// One record per build step, base step excluded
    pub history: &'a [HistoryRecord],
    pub created: DateTime<Utc>,
}

/// Image creation time: `SOURCE_DATE_EPOCH` if set, otherwise now.
pub fn created_timestamp() -> DateTime<Utc> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

fn oci_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Uncompressed digests of the base layers, computed when the base config
/// does not record them.
fn base_diff_ids(base: &BaseImage) -> Result<Vec<String>> {
    base.layers
        .iter()
        .map(|layer| match &layer.diff_id {
            Some(diff_id) => Ok(diff_id.clone()),
            None => diff_id_of(&layer.path).map(|hex| format!("sha256:{}", hex)),
        })
        .collect()
}

/// The OCI image config document for `assembly`.
pub fn image_config_json(assembly: &Assembly<'_>) -> Result<serde_json::Value> {
    let created = assembly.created.to_rfc3339();

    let mut diff_ids = base_diff_ids(assembly.base)?;
    diff_ids.extend(assembly.layers.iter().map(|l| l.layer.diff_id.clone()));

    let history: Vec<serde_json::Value> = assembly
        .base
        .config
        .history
        .iter()
        .chain(assembly.history.iter())
        .map(|h| {
            let mut entry = serde_json::json!({
                "created": created,
                "created_by": h.created_by
            });
            if h.empty_layer {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        })
        .collect();

    let config = assembly.config;
    let mut section = serde_json::Map::new();
    if !config.env.is_empty() {
        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        section.insert("Env".to_string(), serde_json::json!(env));
    }
    if let Some(entrypoint) = &config.entrypoint {
        section.insert(
            "Entrypoint".to_string(),
            serde_json::json!(entrypoint.argv()),
        );
    }
    section.insert(
        "WorkingDir".to_string(),
        serde_json::json!(config.workdir.as_str()),
    );
    if !config.exposed_ports.is_empty() {
        let ports: BTreeMap<String, serde_json::Value> = config
            .exposed_ports
            .config_keys()
            .into_iter()
            .map(|p| (p, serde_json::json!({})))
            .collect();
        section.insert("ExposedPorts".to_string(), serde_json::json!(ports));
    }
    if !config.labels.is_empty() {
        section.insert("Labels".to_string(), serde_json::json!(config.labels));
    }

    Ok(serde_json::json!({
        "architecture": oci_architecture(),
        "os": "linux",
        "created": created,
        "config": section,
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids
        },
        "history": history
    }))
}

/// Write the image layout and tag it in `store`.
///
/// Nothing is tagged unless the whole layout was written.
pub async fn assemble(
    store: &ImageStore,
    tag: &ImageReference,
    assembly: &Assembly<'_>,
) -> Result<StoredImage> {
    let config = image_config_json(assembly)?;

    let mut layers: Vec<LayoutLayer> = assembly
        .base
        .layers
        .iter()
        .map(|l| LayoutLayer {
            source: l.path.clone(),
            digest: l.digest.clone(),
            size: l.size,
        })
        .collect();
    layers.extend(assembly.layers.iter().map(|l| LayoutLayer {
        source: l.blob.clone(),
        digest: l.layer.digest.clone(),
        size: l.layer.size,
    }));

    let staging = tempfile::Builder::new()
        .prefix("assemble-")
        .tempdir_in(store.store_dir().join("tmp"))
        .map_err(|e| {
            StrataError::StoreError(format!("Failed to create assembly directory: {}", e))
        })?;

    let reference = tag.full_reference();
    let digest = write_layout(staging.path(), &layers, &config, Some(&reference))?;
    let stored = store
        .put(&reference, &digest, staging.path(), ImageSource::Built)
        .await?;

    tracing::info!(
        reference = %reference,
        digest = %digest,
        layers = layers.len(),
        "Image assembled"
    );
    Ok(stored)
}
