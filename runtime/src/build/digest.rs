//! Content hashing and layer cache keys.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::error::{Result, StrataError};
use strata_core::BuildStage;

/// Compute SHA256 digest of a file, streaming its content.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to open file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Writer adapter that hashes everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Hex digest of the bytes written so far, and the wrapped writer.
    pub fn finish(self) -> (String, W) {
        (hex::encode(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Content-derived identity of a layer: hex SHA256 over the step that
/// produces it and everything that step reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key of a resolved base image.
    pub fn for_base(reference: &str, manifest_digest: &str) -> Self {
        KeyBuilder::new(BuildStage::Base)
            .field("reference", reference)
            .field("manifest", manifest_digest)
            .finish()
    }

    /// Wrap an existing hex key, e.g. one read back from disk.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::CacheError(format!(
                "malformed cache key '{}'",
                hex
            )));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental builder for a [`CacheKey`].
///
/// Every field is written as `len(name) name len(value) value` with
/// big-endian u64 lengths, so no two field sequences share an encoding.
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    pub fn new(kind: BuildStage) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.write("kind", kind.to_string().as_bytes());
        builder
    }

    pub fn field(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.write(name, value.as_ref());
        self
    }

    /// Add the parent layer's key; the root of a chain has none.
    pub fn parent(self, parent: Option<&CacheKey>) -> Self {
        let value = parent.map(|k| k.as_str()).unwrap_or("");
        self.field("parent", value)
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(hex::encode(self.hasher.finalize()))
    }

    fn write(&mut self, name: &str, value: &[u8]) {
        self.hasher.update((name.len() as u64).to_be_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value);
    }
}
