//! Base image resolution.
//!
//! Turns an image reference into immutable local content: an OCI layout in
//! the image store plus the cache key every later layer chains from. The
//! store is consulted first; a registry pull happens only on a miss and
//! never in offline mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strata_core::error::{Result, StrataError};

use super::image::{ImageLayer, OciImage, OciImageConfig};
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller};
use super::store::{ImageSource, ImageStore, StoredImage};
use crate::build::digest::CacheKey;

/// A resolved base image.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageReference,
    /// Manifest digest ("sha256:...")
    pub manifest_digest: String,
    /// Root of the layer chain
    pub key: CacheKey,
    /// OCI layout directory
    pub root_dir: PathBuf,
    /// Layer blobs, bottom to top
    pub layers: Vec<ImageLayer>,
    pub config: OciImageConfig,
}

impl BaseImage {
    /// Load a base image from an OCI layout on disk.
    pub fn from_layout(reference: ImageReference, root_dir: &Path) -> Result<Self> {
        let image = OciImage::from_path(root_dir)?;
        let manifest_digest = image.manifest_digest().to_string();
        let key = CacheKey::for_base(&reference.full_reference(), &manifest_digest);
        Ok(Self {
            reference,
            manifest_digest,
            key,
            root_dir: root_dir.to_path_buf(),
            layers: image.layers().to_vec(),
            config: image.config().clone(),
        })
    }
}

/// Resolves a base image reference to local content.
#[async_trait]
pub trait BaseImageResolver: Send + Sync {
    /// Resolve `reference`. Repeated calls with an unchanged store return
    /// the same content.
    async fn resolve(&self, reference: &ImageReference) -> Result<BaseImage>;
}

/// Cache-first resolver backed by the local image store.
pub struct StoreResolver {
    store: Arc<ImageStore>,
    /// `None` in offline mode
    puller: Option<RegistryPuller>,
}

impl StoreResolver {
    /// Resolver that pulls missing images from their registry.
    pub fn new(store: Arc<ImageStore>, auth: RegistryAuth) -> Self {
        Self {
            store,
            puller: Some(RegistryPuller::with_auth(auth)),
        }
    }

    /// Resolver that only ever reads the local store.
    pub fn offline(store: Arc<ImageStore>) -> Self {
        Self {
            store,
            puller: None,
        }
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    /// Register an existing OCI layout under `reference`.
    pub async fn import(
        &self,
        layout_dir: &Path,
        reference: &ImageReference,
    ) -> Result<StoredImage> {
        let image = OciImage::from_path(layout_dir)?;
        let stored = self
            .store
            .put(
                &reference.full_reference(),
                image.manifest_digest(),
                layout_dir,
                ImageSource::Imported,
            )
            .await?;

        tracing::info!(
            reference = %reference,
            digest = %stored.digest,
            "Imported image layout"
        );
        Ok(stored)
    }

    async fn resolve_inner(&self, reference: &ImageReference) -> Result<BaseImage> {
        let full_ref = reference.full_reference();

        if let Some(stored) = self.store.get(&full_ref).await {
            tracing::debug!(reference = %full_ref, digest = %stored.digest, "Using stored image");
            return BaseImage::from_layout(reference.clone(), &stored.path);
        }

        // A digest-pinned reference may already be present under another tag
        if let Some(digest) = &reference.digest {
            if let Some(stored) = self.store.get_by_digest(digest).await {
                let stored = self
                    .store
                    .put(&full_ref, digest, &stored.path, stored.source)
                    .await?;
                return BaseImage::from_layout(reference.clone(), &stored.path);
            }
        }

        let Some(puller) = &self.puller else {
            return Err(resolution_error(
                reference,
                "image is not in the local store and offline mode is enabled".to_string(),
            ));
        };

        let staging = tempfile::Builder::new()
            .prefix("pull-")
            .tempdir_in(self.store.store_dir().join("tmp"))
            .map_err(|e| resolution_error(reference, format!("Failed to create temp dir: {}", e)))?;

        let digest = puller.pull(reference, staging.path()).await?;
        let stored = self
            .store
            .put(&full_ref, &digest, staging.path(), ImageSource::Pulled)
            .await?;

        let evicted = self.store.evict().await?;
        if !evicted.is_empty() {
            tracing::info!(
                count = evicted.len(),
                references = ?evicted,
                "Evicted images from store"
            );
        }

        BaseImage::from_layout(reference.clone(), &stored.path)
    }
}

#[async_trait]
impl BaseImageResolver for StoreResolver {
    async fn resolve(&self, reference: &ImageReference) -> Result<BaseImage> {
        self.resolve_inner(reference).await.map_err(|e| match e {
            resolution @ StrataError::Resolution { .. } => resolution,
            other => resolution_error(reference, other.to_string()),
        })
    }
}

fn resolution_error(reference: &ImageReference, message: String) -> StrataError {
    StrataError::Resolution {
        reference: reference.to_string(),
        message,
    }
}
