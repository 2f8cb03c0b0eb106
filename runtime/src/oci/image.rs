//! OCI image parsing and representation.
//!
//! Handles parsing of OCI image layout including manifest and configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use strata_core::error::{Result, StrataError};

/// Represents an OCI image loaded from disk.
#[derive(Debug)]
pub struct OciImage {
    /// Root directory of the OCI image layout
    root_dir: PathBuf,

    /// Digest of the image manifest ("sha256:...")
    manifest_digest: String,

    /// Image configuration
    config: OciImageConfig,

    /// Layer blobs (in order, bottom to top)
    layers: Vec<ImageLayer>,
}

/// One layer blob of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLayer {
    /// Path to the blob inside the layout
    pub path: PathBuf,
    /// Compressed digest ("sha256:...")
    pub digest: String,
    /// Uncompressed digest ("sha256:...") from the config's rootfs section
    pub diff_id: Option<String>,
    /// Compressed size in bytes
    pub size: u64,
}

/// A history record of the image config.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub created_by: String,
    pub empty_layer: bool,
}

/// Parsed OCI image configuration.
#[derive(Debug, Clone, Default)]
pub struct OciImageConfig {
    /// Entrypoint command
    pub entrypoint: Option<Vec<String>>,

    /// Default command arguments
    pub cmd: Option<Vec<String>>,

    /// Environment variables
    pub env: Vec<(String, String)>,

    /// Working directory
    pub working_dir: Option<String>,

    /// Exposed ports ("8000/tcp")
    pub exposed_ports: Vec<String>,

    /// Labels
    pub labels: HashMap<String, String>,

    /// Creation timestamp, as recorded
    pub created: Option<String>,

    pub history: Vec<HistoryRecord>,

    /// Uncompressed layer digests, bottom to top
    pub diff_ids: Vec<String>,
}

impl OciImageConfig {
    /// The argument vector a container runs: entrypoint followed by cmd.
    pub fn command(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .flatten()
            .chain(self.cmd.iter().flatten())
            .cloned()
            .collect()
    }

    /// Value of an environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Create from OCI spec ImageConfiguration.
    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let config = oci_config.config().as_ref();

        let env = config
            .and_then(|c| c.env().as_ref())
            .map(|env_list| {
                env_list
                    .iter()
                    .filter_map(|e| e.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let history = oci_config
            .history()
            .iter()
            .map(|h| HistoryRecord {
                created_by: h.created_by().clone().unwrap_or_default(),
                empty_layer: matches!(h.empty_layer(), Some(true)),
            })
            .collect();

        Self {
            entrypoint: config.and_then(|c| c.entrypoint().clone()),
            cmd: config.and_then(|c| c.cmd().clone()),
            env,
            working_dir: config.and_then(|c| c.working_dir().clone()),
            exposed_ports: config
                .and_then(|c| c.exposed_ports().clone())
                .unwrap_or_default(),
            labels: config.and_then(|c| c.labels().clone()).unwrap_or_default(),
            created: oci_config.created().clone(),
            history,
            diff_ids: oci_config.rootfs().diff_ids().clone(),
        }
    }
}

impl OciImage {
    /// Load an OCI image from a directory.
    ///
    /// The directory must contain a valid OCI image layout:
    /// - oci-layout file
    /// - index.json
    /// - blobs/sha256/ directory with manifest, config, and layers
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        Self::validate_oci_layout(&root_dir)?;
        let index = Self::load_index(&root_dir)?;

        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| {
                StrataError::StoreError(format!(
                    "No manifests in index.json at {}",
                    root_dir.display()
                ))
            })?
            .digest()
            .to_string();

        let manifest = Self::load_manifest(&root_dir, &manifest_digest)?;
        let config = Self::load_config(&root_dir, manifest.config().digest())?;

        let layers = manifest
            .layers()
            .iter()
            .enumerate()
            .map(|(i, layer)| ImageLayer {
                path: Self::blob_path(&root_dir, layer.digest()),
                digest: layer.digest().to_string(),
                diff_id: config.diff_ids.get(i).cloned(),
                size: layer.size() as u64,
            })
            .collect();

        Ok(Self {
            root_dir,
            manifest_digest,
            config,
            layers,
        })
    }

    /// Get the image configuration.
    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    /// Get all layer blobs (in order, bottom to top).
    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    /// Get the root directory of the OCI image.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// Get the working directory.
    pub fn working_dir(&self) -> Option<&str> {
        self.config.working_dir.as_deref()
    }

    /// Get a label value by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(|s| s.as_str())
    }

    /// Validate that the directory contains a valid OCI layout.
    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(StrataError::StoreError(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Load the image index from index.json.
    fn load_index(root_dir: &Path) -> Result<ImageIndex> {
        let index_path = root_dir.join("index.json");
        let content = std::fs::read_to_string(&index_path).map_err(|e| {
            StrataError::StoreError(format!(
                "Failed to read index.json at {}: {}",
                index_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| StrataError::StoreError(format!("Failed to parse index.json: {}", e)))
    }

    /// Load the image manifest from blobs.
    fn load_manifest(root_dir: &Path, digest: &str) -> Result<ImageManifest> {
        let blob_path = Self::blob_path(root_dir, digest);
        let content = std::fs::read_to_string(&blob_path).map_err(|e| {
            StrataError::StoreError(format!(
                "Failed to read manifest at {}: {}",
                blob_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| StrataError::StoreError(format!("Failed to parse manifest: {}", e)))
    }

    /// Load the image configuration from blobs.
    fn load_config(root_dir: &Path, digest: &str) -> Result<OciImageConfig> {
        let blob_path = Self::blob_path(root_dir, digest);
        let content = std::fs::read_to_string(&blob_path).map_err(|e| {
            StrataError::StoreError(format!(
                "Failed to read config at {}: {}",
                blob_path.display(),
                e
            ))
        })?;

        let oci_config: ImageConfiguration = serde_json::from_str(&content)
            .map_err(|e| StrataError::StoreError(format!("Failed to parse config: {}", e)))?;

        Ok(OciImageConfig::from_oci_config(&oci_config))
    }

    /// Get the path to a blob by digest.
    pub(crate) fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
        let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
        root_dir.join("blobs").join(algorithm).join(hash)
    }
}
