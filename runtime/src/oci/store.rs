//! Disk-based OCI image store with LRU eviction.
//!
//! Holds resolved base images and built images as OCI layouts, with an
//! in-memory index backed by a persistent `index.json`. Layout copies and
//! index writes go through a staging path and a rename, so a crash never
//! leaves a half-written image visible.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};
use tokio::sync::RwLock;

/// How an image entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Pulled,
    Imported,
    Built,
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Pulled => write!(f, "pulled"),
            ImageSource::Imported => write!(f, "imported"),
            ImageSource::Built => write!(f, "built"),
        }
    }
}

/// Metadata for a stored OCI image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Normalized reference (e.g., "docker.io/library/python:3.12")
    pub reference: String,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Total size in bytes
    pub size_bytes: u64,
    pub source: ImageSource,
    /// When the image entered the store
    pub created_at: DateTime<Utc>,
    /// When the image was last used
    pub last_used: DateTime<Utc>,
    /// Path to the OCI image layout on disk
    pub path: PathBuf,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with in-memory index and LRU eviction.
pub struct ImageStore {
    store_dir: PathBuf,
    /// reference → StoredImage
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
    max_size_bytes: u64,
}

impl ImageStore {
    /// Open (or create) a store rooted at `store_dir`.
    pub fn new(store_dir: &Path, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(store_dir.join("tmp")).map_err(|e| {
            StrataError::StoreError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
            max_size_bytes,
        })
    }

    /// Get a stored image by reference, refreshing its last-used time.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        let mut index = self.index.write().await;
        let image = index.get_mut(reference)?;
        image.last_used = Utc::now();
        let updated = image.clone();
        drop(index);
        // Best-effort save of updated last_used
        let _ = self.save_index().await;
        Some(updated)
    }

    /// Get a stored image by manifest digest.
    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        let index = self.index.read().await;
        index.values().find(|img| img.digest == digest).cloned()
    }

    /// Store the OCI layout in `source_dir` under `reference`.
    ///
    /// The layout is copied into `sha256/<digest>/` unless an image with
    /// that digest is already present. Re-putting a reference replaces the
    /// previous mapping.
    pub async fn put(
        &self,
        reference: &str,
        digest: &str,
        source_dir: &Path,
        source: ImageSource,
    ) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if !target_dir.exists() {
            let staging = tempfile::Builder::new()
                .prefix("image-")
                .tempdir_in(self.store_dir.join("tmp"))
                .map_err(|e| {
                    StrataError::StoreError(format!("Failed to create staging directory: {}", e))
                })?;
            copy_dir_recursive(source_dir, staging.path()).map_err(|e| {
                StrataError::StoreError(format!("Failed to copy image to store: {}", e))
            })?;
            if let Some(parent) = target_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let staged = staging.into_path();
            if let Err(e) = std::fs::rename(&staged, &target_dir) {
                let _ = std::fs::remove_dir_all(&staged);
                // A concurrent put of the same digest won the race
                if !target_dir.exists() {
                    return Err(StrataError::StoreError(format!(
                        "Failed to publish image {}: {}",
                        digest, e
                    )));
                }
            }
        }

        let now = Utc::now();
        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: dir_size(&target_dir),
            source,
            created_at: now,
            last_used: now,
            path: target_dir,
        };

        let mut index = self.index.write().await;
        index.insert(reference.to_string(), stored.clone());
        drop(index);

        self.save_index().await?;

        tracing::debug!(
            reference,
            digest,
            source = %stored.source,
            "Stored image"
        );
        Ok(stored)
    }

    /// Remove an image by reference.
    ///
    /// The layout directory is deleted once no other reference points at
    /// the same digest.
    pub async fn remove(&self, reference: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let Some(image) = index.remove(reference) else {
            return Err(StrataError::StoreError(format!(
                "Image not found: {}",
                reference
            )));
        };
        let digest_still_used = index.values().any(|img| img.digest == image.digest);
        drop(index);

        self.save_index().await?;

        if !digest_still_used && image.path.exists() {
            std::fs::remove_dir_all(&image.path).map_err(|e| {
                StrataError::StoreError(format!(
                    "Failed to remove image directory {}: {}",
                    image.path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// List all stored images, sorted by reference.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        images
    }

    /// Evict least-recently-used images until total size is under the limit.
    ///
    /// Returns the references of evicted images.
    pub async fn evict(&self) -> Result<Vec<String>> {
        let mut evicted = Vec::new();

        while self.total_size().await > self.max_size_bytes {
            let lru_ref = {
                let index = self.index.read().await;
                index
                    .values()
                    .min_by_key(|img| img.last_used)
                    .map(|img| img.reference.clone())
            };

            match lru_ref {
                Some(reference) => {
                    self.remove(&reference).await?;
                    evicted.push(reference);
                }
                None => break,
            }
        }

        Ok(evicted)
    }

    /// Total size of all stored images in bytes.
    ///
    /// Digests shared by several references are counted once.
    pub async fn total_size(&self) -> u64 {
        let index = self.index.read().await;
        let mut seen = std::collections::HashSet::new();
        index
            .values()
            .filter(|img| seen.insert(img.digest.as_str()))
            .map(|img| img.size_bytes)
            .sum()
    }

    async fn save_index(&self) -> Result<()> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        drop(index);
        images.sort_by(|a, b| a.reference.cmp(&b.reference));

        let data = serde_json::to_string_pretty(&StoreIndex { images })?;
        let index_path = self.store_dir.join("index.json");
        let tmp_path = self.store_dir.join("tmp").join(format!(
            "index-{}.json",
            uuid::Uuid::new_v4().simple()
        ));

        let write_err = |e: std::io::Error| {
            StrataError::StoreError(format!(
                "Failed to write image store index {}: {}",
                index_path.display(),
                e
            ))
        };
        tokio::fs::write(&tmp_path, data).await.map_err(write_err)?;
        tokio::fs::rename(&tmp_path, &index_path)
            .await
            .map_err(write_err)?;

        Ok(())
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }
}

fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
    let index_path = store_dir.join("index.json");
    if !index_path.exists() {
        return Ok(HashMap::new());
    }

    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        StrataError::StoreError(format!(
            "Failed to read image store index {}: {}",
            index_path.display(),
            e
        ))
    })?;

    let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
        StrataError::StoreError(format!("Failed to parse image store index: {}", e))
    })?;

    // Only include images whose directories still exist
    Ok(store_index
        .images
        .into_iter()
        .filter(|image| image.path.exists())
        .map(|image| (image.reference.clone(), image))
        .collect())
}

/// Recursively copy a directory.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_oci_layout(dir: &Path) {
        std::fs::create_dir_all(dir.join("blobs/sha256")).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("index.json"), r#"{"manifests":[]}"#).unwrap();
        std::fs::write(dir.join("blobs/sha256/testblob"), "x".repeat(1024)).unwrap();
    }

    #[tokio::test]
    async fn test_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("images");
        let store = ImageStore::new(&store_dir, 1024 * 1024).unwrap();
        assert!(store_dir.exists());
        assert_eq!(store.total_size().await, 0);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        let stored = store
            .put("docker.io/library/python:3.12", "sha256:abc123", &source_dir, ImageSource::Pulled)
            .await
            .unwrap();

        assert_eq!(stored.digest, "sha256:abc123");
        assert_eq!(stored.source, ImageSource::Pulled);
        assert!(stored.size_bytes >= 1024);
        assert!(stored.path.join("blobs/sha256/testblob").exists());

        let fetched = store.get("docker.io/library/python:3.12").await.unwrap();
        assert_eq!(fetched.digest, "sha256:abc123");

        let fetched = store.get_by_digest("sha256:abc123").await.unwrap();
        assert_eq!(fetched.reference, "docker.io/library/python:3.12");

        // Staging leftovers are never visible
        assert_eq!(std::fs::read_dir(store_dir.join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), 1024 * 1024).unwrap();
        assert!(store.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_retag_replaces_mapping() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        store
            .put("app:dev", "sha256:one", &source_dir, ImageSource::Built)
            .await
            .unwrap();
        store
            .put("app:dev", "sha256:two", &source_dir, ImageSource::Built)
            .await
            .unwrap();

        assert_eq!(store.list().await.len(), 1);
        assert_eq!(store.get("app:dev").await.unwrap().digest, "sha256:two");
    }

    #[tokio::test]
    async fn test_remove_keeps_shared_digest() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        let a = store
            .put("app:1", "sha256:same", &source_dir, ImageSource::Built)
            .await
            .unwrap();
        store
            .put("app:latest", "sha256:same", &source_dir, ImageSource::Built)
            .await
            .unwrap();

        store.remove("app:1").await.unwrap();
        assert!(a.path.exists());
        store.remove("app:latest").await.unwrap();
        assert!(!a.path.exists());
    }

    #[tokio::test]
    async fn test_remove_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), 1024 * 1024).unwrap();
        assert!(store.remove("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        store
            .put("zeta:1", "sha256:aaa", &source_dir, ImageSource::Imported)
            .await
            .unwrap();
        store
            .put("alpha:1", "sha256:bbb", &source_dir, ImageSource::Imported)
            .await
            .unwrap();

        let refs: Vec<String> = store.list().await.into_iter().map(|i| i.reference).collect();
        assert_eq!(refs, vec!["alpha:1", "zeta:1"]);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        // Room for exactly one image
        let store = ImageStore::new(&store_dir, 1500).unwrap();

        store
            .put("old:v1", "sha256:old1", &source_dir, ImageSource::Pulled)
            .await
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        store
            .put("new:v2", "sha256:new2", &source_dir, ImageSource::Pulled)
            .await
            .unwrap();
        store.get("new:v2").await;

        let evicted = store.evict().await.unwrap();
        assert_eq!(evicted, vec!["old:v1".to_string()]);
        assert!(store.get("new:v2").await.is_some());
    }

    #[tokio::test]
    async fn test_index_persistence() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        {
            let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
            store
                .put("app:v1", "sha256:persist", &source_dir, ImageSource::Built)
                .await
                .unwrap();
        }

        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        let image = store.get("app:v1").await.unwrap();
        assert_eq!(image.digest, "sha256:persist");
        assert_eq!(image.source, ImageSource::Built);
    }
}
