//! OCI image layout writer.

use std::path::{Path, PathBuf};

use strata_core::error::{Result, StrataError};

use crate::build::digest::sha256_bytes;

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// A layer blob to place in a layout.
#[derive(Debug, Clone)]
pub struct LayoutLayer {
    /// Where the compressed blob currently lives
    pub source: PathBuf,
    /// "sha256:..." of the compressed blob
    pub digest: String,
    pub size: u64,
}

/// Write a single-manifest OCI image layout to `dir`.
///
/// Layer blobs are hard-linked when possible and copied otherwise.
/// `config` is written verbatim as the config blob. Returns the manifest
/// digest ("sha256:...").
pub fn write_layout(
    dir: &Path,
    layers: &[LayoutLayer],
    config: &serde_json::Value,
    ref_name: Option<&str>,
) -> Result<String> {
    let blobs_dir = dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        StrataError::StoreError(format!(
            "Failed to create blobs directory {}: {}",
            blobs_dir.display(),
            e
        ))
    })?;

    let mut layer_descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        let hex = layer.digest.strip_prefix("sha256:").unwrap_or(&layer.digest);
        let blob_path = blobs_dir.join(hex);
        if !blob_path.exists() {
            link_or_copy(&layer.source, &blob_path)?;
        }
        layer_descriptors.push(serde_json::json!({
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": layer.digest,
            "size": layer.size
        }));
    }

    let config_bytes = serde_json::to_vec_pretty(config)?;
    let config_digest = sha256_bytes(&config_bytes);
    write_blob(&blobs_dir, &config_digest, &config_bytes)?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len()
        },
        "layers": layer_descriptors
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    write_blob(&blobs_dir, &manifest_digest, &manifest_bytes)?;

    let mut descriptor = serde_json::json!({
        "mediaType": MANIFEST_MEDIA_TYPE,
        "digest": format!("sha256:{}", manifest_digest),
        "size": manifest_bytes.len()
    });
    if let Some(name) = ref_name {
        descriptor["annotations"] = serde_json::json!({
            "org.opencontainers.image.ref.name": name
        });
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [descriptor]
    });
    std::fs::write(dir.join("index.json"), serde_json::to_string_pretty(&index)?)
        .map_err(|e| StrataError::StoreError(format!("Failed to write index.json: {}", e)))?;

    std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)
        .map_err(|e| StrataError::StoreError(format!("Failed to write oci-layout: {}", e)))?;

    Ok(format!("sha256:{}", manifest_digest))
}

fn write_blob(blobs_dir: &Path, hex: &str, data: &[u8]) -> Result<()> {
    std::fs::write(blobs_dir.join(hex), data)
        .map_err(|e| StrataError::StoreError(format!("Failed to write blob {}: {}", hex, e)))
}

fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if std::fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst).map(|_| ()).map_err(|e| {
        StrataError::StoreError(format!(
            "Failed to copy blob {} to {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::layer::pack_dir;
    use crate::oci::OciImage;
    use tempfile::TempDir;

    #[test]
    fn test_written_layout_loads_back() {
        let tmp = TempDir::new().unwrap();
        let content = tmp.path().join("content");
        std::fs::create_dir_all(content.join("bin")).unwrap();
        std::fs::write(content.join("bin/run"), "#!/bin/sh\n").unwrap();
        let blob = tmp.path().join("layer.tar.gz");
        let archive = pack_dir(&content, &blob).unwrap();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Env": ["PATH=/bin"], "WorkingDir": "/app" },
            "rootfs": { "type": "layers", "diff_ids": [format!("sha256:{}", archive.diff_id)] },
            "history": [{ "created_by": "test", "empty_layer": false }]
        });
        let out = tmp.path().join("layout");
        let digest = write_layout(
            &out,
            &[LayoutLayer {
                source: blob,
                digest: format!("sha256:{}", archive.digest),
                size: archive.size,
            }],
            &config,
            Some("runtime:X"),
        )
        .unwrap();

        let image = OciImage::from_path(&out).unwrap();
        assert_eq!(image.manifest_digest(), digest);
        assert_eq!(image.working_dir(), Some("/app"));
        assert_eq!(image.layers().len(), 1);
        assert!(image.layers()[0].path.is_file());
        assert_eq!(
            image.layers()[0].diff_id.as_deref(),
            Some(format!("sha256:{}", archive.diff_id).as_str())
        );
    }

    #[test]
    fn test_same_input_same_manifest_digest() {
        let tmp = TempDir::new().unwrap();
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [] }
        });
        let a = write_layout(&tmp.path().join("a"), &[], &config, None).unwrap();
        let b = write_layout(&tmp.path().join("b"), &[], &config, None).unwrap();
        assert_eq!(a, b);
    }
}
