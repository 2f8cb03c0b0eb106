//! Image reference parsing.
//!
//! Turns `python:3.12-slim`, `ghcr.io/org/app:v1` or
//! `runtime@sha256:...` into a normalized [`ImageReference`].

use strata_core::error::{Result, StrataError};

/// Registry used when the reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference names neither tag nor digest.
const DEFAULT_TAG: &str = "latest";

/// A named, versioned image reference: `{name, tag|digest}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/python")
    pub repository: String,
    /// Tag (e.g., "3.12-slim")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `python` → docker.io/library/python:latest
    /// - `python:3.12` → docker.io/library/python:3.12
    /// - `org/app` → docker.io/org/app:latest
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:abc...` → pinned by digest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StrataError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(StrataError::InvalidReference(format!(
                "'{}' contains whitespace",
                reference
            )));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                let valid = digest
                    .split_once(':')
                    .map(|(algo, hex)| !algo.is_empty() && !hex.is_empty())
                    .unwrap_or(false);
                if !valid {
                    return Err(StrataError::InvalidReference(format!(
                        "invalid digest in '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if name.is_empty() {
            return Err(StrataError::InvalidReference(format!(
                "missing image name in '{}'",
                reference
            )));
        }
        if matches!(tag, Some(t) if t.is_empty()) {
            return Err(StrataError::InvalidReference(format!(
                "empty tag in '{}'",
                reference
            )));
        }

        let (registry, repository) = split_registry(name)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether the reference is pinned to immutable content.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name[:tag]`. A colon before the last `/` belongs to a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            let candidate = &name_tag[colon + 1..];
            // `localhost:5000` with no repository is a host, not a tag
            if last_segment_start == 0
                && !candidate.is_empty()
                && candidate.chars().all(|c| c.is_ascii_digit())
                && &name_tag[..colon] == "localhost"
            {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(candidate))
            }
        }
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(StrataError::InvalidReference(format!(
                    "empty repository in '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }

    // Single-segment names live under Docker Hub's library namespace
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}
