//! Ignore list for the source copy.
//!
//! Built-in default patterns (unless disabled) plus the first ignore file
//! found in the build context, in gitignore syntax. `!pattern` re-includes
//! a path excluded by an earlier pattern.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use strata_core::error::{Result, StrataError};
use strata_core::IgnoreConfig;

#[derive(Debug)]
pub struct IgnoreList {
    matcher: Gitignore,
    /// Ignore file that contributed patterns, if any
    source: Option<String>,
}

impl IgnoreList {
    /// Build the ignore list for `context_dir`.
    pub fn load(context_dir: &Path, config: &IgnoreConfig) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(context_dir);

        if config.use_defaults {
            for pattern in &config.default_patterns {
                builder.add_line(None, pattern).map_err(|e| {
                    StrataError::ConfigError(format!("invalid ignore pattern '{}': {}", pattern, e))
                })?;
            }
        }

        let mut source = None;
        for name in &config.files {
            let path = context_dir.join(name);
            if path.is_file() {
                if let Some(e) = builder.add(&path) {
                    return Err(StrataError::SourceCopy {
                        path: name.clone(),
                        message: format!("invalid ignore file: {}", e),
                    });
                }
                source = Some(name.clone());
                break;
            }
        }

        let matcher = builder
            .build()
            .map_err(|e| StrataError::ConfigError(format!("invalid ignore list: {}", e)))?;

        tracing::debug!(
            context = %context_dir.display(),
            patterns = matcher.num_ignores(),
            file = source.as_deref().unwrap_or("-"),
            "Loaded ignore list"
        );

        Ok(Self { matcher, source })
    }

    /// Whether `relative` (a path inside the context) is excluded, either
    /// directly or through one of its parents.
    pub fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool {
        if relative.as_os_str().is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}
