//! Content-addressed layer cache shared by all builds.
//!
//! Entries are stored under their cache key, archives under their digest:
//!
//! ```text
//! <cache>/blobs/<digest>.tar.gz  layer archive, immutable once written
//! <cache>/entries/<key>.json     layer metadata (commit marker)
//! <cache>/tmp/                   staging area for in-flight writes
//! ```
//!
//! Writers stage everything in `tmp/` and rename into place, blob first and
//! entry last. The entry rename is the only commit point: a blob path never
//! changes content, so an entry always names bytes matching its digest and
//! racing writers of one key leave whichever entry landed last.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};
use strata_core::BuildStage;
use tempfile::{NamedTempFile, TempDir};

use crate::build::digest::CacheKey;

/// A content-addressed filesystem delta produced by one build step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Cache key derived from the step and its inputs
    pub key: CacheKey,
    /// Key of the layer this one was built on
    pub parent: Option<CacheKey>,
    /// Step that produced the layer
    pub kind: BuildStage,
    /// Instruction text, as written in the build file
    pub instruction: String,
    /// Compressed archive digest ("sha256:...")
    pub digest: String,
    /// Uncompressed archive digest ("sha256:...")
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// On-disk entry: the layer plus cache bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    #[serde(flatten)]
    layer: Layer,
    /// Last time this layer was read (Unix timestamp)
    last_accessed: i64,
}

/// A layer present in the cache.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub layer: Layer,
    /// Path to the layer archive
    pub blob: PathBuf,
    pub last_accessed: i64,
}

/// Content-addressed cache for built layers.
pub struct LayerCache {
    /// Root directory for the cache (e.g., ~/.strata/cache)
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Open (creating if needed) a layer cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        for sub in ["blobs", "entries", "tmp"] {
            let dir = cache_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| {
                StrataError::CacheError(format!(
                    "Failed to create layer cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.cache_dir
    }

    /// Archive path for a compressed digest ("sha256:...").
    fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.blobs_dir().join(format!("{}.tar.gz", hex))
    }

    fn blobs_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs")
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir
            .join("entries")
            .join(format!("{}.json", key.as_str()))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }

    /// A fresh staging file. Dropped without `publish`, it is deleted.
    pub fn staging_file(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("layer-")
            .suffix(".tar.gz")
            .tempfile_in(self.tmp_dir())
            .map_err(|e| StrataError::CacheError(format!("Failed to create staging file: {}", e)))
    }

    /// A fresh staging directory, removed on drop.
    pub fn staging_dir(&self, prefix: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.tmp_dir())
            .map_err(|e| {
                StrataError::CacheError(format!("Failed to create staging directory: {}", e))
            })
    }

    /// Look up a layer by key, updating its access time.
    ///
    /// Returns `None` if the layer is not cached or the entry is unusable.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CachedLayer>> {
        let Some(mut entry) = self.read_entry(key) else {
            return Ok(None);
        };
        let blob = self.blob_path(&entry.layer.digest);
        if !blob.is_file() {
            return Ok(None);
        }

        entry.last_accessed = Utc::now().timestamp();
        if let Err(e) = self.write_entry(&entry) {
            tracing::debug!(key = %key, error = %e, "Failed to refresh layer access time");
        }

        Ok(Some(CachedLayer {
            layer: entry.layer,
            blob,
            last_accessed: entry.last_accessed,
        }))
    }

    /// Whether a complete layer is registered under `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read_entry(key)
            .map(|entry| self.blob_path(&entry.layer.digest).is_file())
            .unwrap_or(false)
    }

    /// Atomically register a staged archive as `layer`.
    ///
    /// `layer.digest` must be the digest of the staged bytes; the archive is
    /// stored under it and an existing archive with that digest is reused.
    pub fn publish(&self, layer: Layer, staged: NamedTempFile) -> Result<CachedLayer> {
        let hex = layer.digest.strip_prefix("sha256:").unwrap_or(&layer.digest);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::CacheError(format!(
                "Invalid layer digest for {}: {}",
                layer.key, layer.digest
            )));
        }

        let blob = self.blob_path(&layer.digest);
        if blob.is_file() {
            drop(staged);
        } else {
            staged.persist(&blob).map_err(|e| {
                StrataError::CacheError(format!(
                    "Failed to publish layer blob {}: {}",
                    blob.display(),
                    e.error
                ))
            })?;
        }

        let entry = CacheEntry {
            layer,
            last_accessed: Utc::now().timestamp(),
        };
        self.write_entry(&entry)?;

        tracing::debug!(
            key = %entry.layer.key,
            digest = %entry.layer.digest,
            size = entry.layer.size,
            "Published layer"
        );

        Ok(CachedLayer {
            layer: entry.layer,
            blob,
            last_accessed: entry.last_accessed,
        })
    }

    /// Remove a cached layer by key. Missing layers are not an error.
    ///
    /// The archive goes too unless another entry still names its digest.
    pub fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let digest = self.read_entry(key).map(|entry| entry.layer.digest);

        // Entry first: the layer disappears before its blob does
        remove_if_present(&self.entry_path(key))?;

        if let Some(digest) = digest {
            let referenced = self.list()?.iter().any(|l| l.layer.digest == digest);
            if !referenced {
                remove_if_present(&self.blob_path(&digest))?;
            }
        }
        Ok(())
    }

    /// List every complete layer in the cache.
    pub fn list(&self) -> Result<Vec<CachedLayer>> {
        let entries_dir = self.cache_dir.join("entries");
        let read_dir = std::fs::read_dir(&entries_dir).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                entries_dir.display(),
                e
            ))
        })?;

        let mut layers = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| {
                StrataError::CacheError(format!("Failed to read directory entry: {}", e))
            })?;
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(entry) = std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<CacheEntry>(&c).ok())
            else {
                continue;
            };
            let blob = self.blob_path(&entry.layer.digest);
            if blob.is_file() {
                layers.push(CachedLayer {
                    layer: entry.layer,
                    blob,
                    last_accessed: entry.last_accessed,
                });
            }
        }

        layers.sort_by(|a, b| a.layer.key.cmp(&b.layer.key));
        Ok(layers)
    }

    /// Get the total size of all cached layers in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|l| l.layer.size).sum())
    }

    /// Prune the cache to stay within the given byte limit.
    ///
    /// Evicts least-recently-accessed layers first, including layers a
    /// running build may already have been handed; that build then fails
    /// when it assembles its image. Use [`prune_idle`](Self::prune_idle)
    /// while builds may be in flight.
    /// Returns the number of layers evicted.
    pub fn prune(&self, max_bytes: u64) -> Result<usize> {
        self.prune_idle(max_bytes, Duration::ZERO)
    }

    /// Like [`prune`](Self::prune), but never evicts a layer read or
    /// published within `grace`, nor an unreferenced archive younger than it.
    pub fn prune_idle(&self, max_bytes: u64, grace: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - grace.as_secs() as i64;
        let mut layers = self.list()?;
        self.sweep_unreferenced(&layers, grace)?;

        let total_size: u64 = layers.iter().map(|l| l.layer.size).sum();
        if total_size <= max_bytes {
            return Ok(0);
        }

        layers.sort_by_key(|l| l.last_accessed);

        let mut current_size = total_size;
        let mut evicted = 0;
        for cached in &layers {
            if current_size <= max_bytes {
                break;
            }
            if !grace.is_zero() && cached.last_accessed > cutoff {
                tracing::debug!(key = %cached.layer.key, "Keeping recently used layer");
                continue;
            }
            self.invalidate(&cached.layer.key)?;
            current_size = current_size.saturating_sub(cached.layer.size);
            evicted += 1;

            tracing::debug!(
                key = %cached.layer.key,
                size = cached.layer.size,
                "Evicted cached layer"
            );
        }

        Ok(evicted)
    }

    /// Delete archives no entry names any more (left behind when a key is
    /// republished with different bytes).
    fn sweep_unreferenced(&self, layers: &[CachedLayer], grace: Duration) -> Result<()> {
        let live: std::collections::HashSet<&Path> =
            layers.iter().map(|l| l.blob.as_path()).collect();
        let read_dir = std::fs::read_dir(self.blobs_dir())?;
        for dir_entry in read_dir {
            let path = dir_entry?.path();
            if live.contains(path.as_path()) {
                continue;
            }
            let age = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age >= grace {
                remove_if_present(&path)?;
                tracing::debug!(blob = %path.display(), "Removed unreferenced layer blob");
            }
        }
        Ok(())
    }

    fn read_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let content = std::fs::read_to_string(self.entry_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.layer.key);
        let mut staged = tempfile::Builder::new()
            .prefix("entry-")
            .tempfile_in(self.tmp_dir())
            .map_err(|e| StrataError::CacheError(format!("Failed to stage entry: {}", e)))?;
        serde_json::to_writer_pretty(staged.as_file_mut(), entry)?;
        staged.persist(&path).map_err(|e| {
            StrataError::CacheError(format!(
                "Failed to write layer entry {}: {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::CacheError(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}
