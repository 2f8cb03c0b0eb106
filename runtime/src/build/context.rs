//! Per-step context threaded through the pipeline.
//!
//! The working directory and environment are plain values: every step
//! receives the current [`StageContext`] and the engine replaces it with
//! the one the step returns. Nothing reads them from shared state.

use std::fmt;
use std::path::PathBuf;

/// An absolute, normalized path inside the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkingDirectory(String);

impl Default for WorkingDirectory {
    fn default() -> Self {
        Self::root()
    }
}

impl WorkingDirectory {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize `path`, treating a relative path as relative to `/`.
    pub fn new(path: &str) -> Self {
        Self::root().change(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve `path` against this directory to an absolute image path.
    ///
    /// `..` never climbs above `/`. A trailing `/` is dropped.
    pub fn resolve(&self, path: &str) -> String {
        let mut parts: Vec<&str> = if path.starts_with('/') {
            Vec::new()
        } else {
            self.0.split('/').filter(|p| !p.is_empty()).collect()
        };

        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }

        format!("/{}", parts.join("/"))
    }

    /// The directory a `WORKDIR path` step moves to.
    pub fn change(&self, path: &str) -> Self {
        Self(self.resolve(path))
    }

    /// This directory relative to an image root, for joining onto a
    /// host-side rootfs path.
    pub fn relative(&self) -> PathBuf {
        PathBuf::from(self.0.trim_start_matches('/'))
    }
}

impl fmt::Display for WorkingDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State visible to a step: where it runs and with which environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageContext {
    pub workdir: WorkingDirectory,
    /// Ordered; setting an existing key replaces it in place
    pub env: Vec<(String, String)>,
}

impl StageContext {
    pub fn new(workdir: WorkingDirectory, env: Vec<(String, String)>) -> Self {
        Self { workdir, env }
    }

    pub fn with_workdir(self, path: &str) -> Self {
        Self {
            workdir: self.workdir.change(path),
            ..self
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.env.push((key.to_string(), value.to_string())),
        }
        self
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Stable encoding of the environment for cache keys.
    pub fn env_fingerprint(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}\0", k, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute() {
        let wd = WorkingDirectory::new("/app");
        assert_eq!(wd.resolve("/usr/bin"), "/usr/bin");
    }

    #[test]
    fn test_resolve_relative() {
        let wd = WorkingDirectory::new("/app");
        assert_eq!(wd.resolve("src"), "/app/src");
        assert_eq!(wd.resolve("."), "/app");
        assert_eq!(wd.resolve("./"), "/app");
    }

    #[test]
    fn test_resolve_root_workdir() {
        assert_eq!(WorkingDirectory::root().resolve("app"), "/app");
    }

    #[test]
    fn test_resolve_parent_never_escapes_root() {
        let wd = WorkingDirectory::new("/app");
        assert_eq!(wd.resolve("../../.."), "/");
        assert_eq!(wd.resolve("../srv//data/"), "/srv/data");
    }

    #[test]
    fn test_change_is_cumulative() {
        let wd = WorkingDirectory::root().change("/app").change("src");
        assert_eq!(wd.as_str(), "/app/src");
        assert_eq!(wd.relative(), PathBuf::from("app/src"));
    }

    #[test]
    fn test_context_is_threaded_by_value() {
        let before = StageContext::default();
        let after = before.clone().with_workdir("/app").with_env("MODE", "prod");
        assert_eq!(before.workdir.as_str(), "/");
        assert!(before.env.is_empty());
        assert_eq!(after.workdir.as_str(), "/app");
        assert_eq!(after.env_var("MODE"), Some("prod"));
    }

    #[test]
    fn test_with_env_replaces_in_place() {
        let ctx = StageContext::default()
            .with_env("A", "1")
            .with_env("B", "2")
            .with_env("A", "3");
        assert_eq!(
            ctx.env,
            vec![("A".to_string(), "3".to_string()), ("B".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_env_fingerprint_distinguishes_values() {
        let a = StageContext::default().with_env("A", "1");
        let b = StageContext::default().with_env("A", "2");
        assert_ne!(a.env_fingerprint(), b.env_fingerprint());
        assert_eq!(a.env_fingerprint(), a.clone().env_fingerprint());
    }
}
