use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Default maximum image store size: 10 GB.
pub const DEFAULT_STORE_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Default maximum layer cache size: 20 GB.
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 20 * 1024 * 1024 * 1024;

/// Name of the configuration file inside the strata home directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Root directory for the layer cache and image store (~/.strata)
    pub home: PathBuf,

    /// Never contact a registry; base images must already be in the store
    pub offline: bool,

    /// Image store size limit before LRU eviction
    pub store_max_bytes: u64,

    /// Layer cache size limit used by `cache prune`
    pub cache_max_bytes: u64,

    /// Source-copy ignore list
    pub ignore: IgnoreConfig,

    /// Isolated command execution
    pub executor: ExecutorConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            home: Self::default_home(),
            offline: false,
            store_max_bytes: DEFAULT_STORE_MAX_BYTES,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            ignore: IgnoreConfig::default(),
            executor: ExecutorConfig::default(),
            log_level: LogLevel::Warn,
        }
    }
}

impl StrataConfig {
    /// Default home directory (~/.strata).
    pub fn default_home() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".strata"))
            .unwrap_or_else(|| PathBuf::from(".strata"))
    }

    /// Load configuration.
    ///
    /// Reads `path` if given, otherwise `$STRATA_HOME/config.yaml` when it
    /// exists, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let home = env("STRATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(Self::default_home);
                let candidate = home.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(env);
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text. Missing fields take defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| StrataError::ConfigError(format!("Invalid config: {}", e)))
    }

    /// Apply `STRATA_HOME` and `STRATA_OFFLINE` overrides.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(home) = lookup("STRATA_HOME").filter(|h| !h.is_empty()) {
            self.home = PathBuf::from(home);
        }
        if let Some(offline) = lookup("STRATA_OFFLINE") {
            self.offline = matches!(offline.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Layer content cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Image store directory.
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    /// Parent directory for composed container root filesystems.
    pub fn run_dir(&self) -> PathBuf {
        self.home.join("run")
    }
}

/// Ignore-list configuration for the source-copy step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Apply `default_patterns` before any context ignore file
    pub use_defaults: bool,

    /// Patterns excluded by default (gitignore syntax)
    pub default_patterns: Vec<String>,

    /// Ignore files looked up in the build context, first match wins
    pub files: Vec<String>,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            default_patterns: [
                ".git", ".hg", ".svn", "__pycache__", "*.pyc", ".venv", ".strata", ".DS_Store",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            files: vec![".strataignore".to_string(), ".dockerignore".to_string()],
        }
    }
}

/// Configuration for isolated command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell used for shell-form commands
    pub shell: Vec<String>,

    /// PATH inside the staging rootfs
    pub path: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: vec!["/bin/sh".to_string(), "-c".to_string()],
            path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StrataConfig::default();
        assert!(!config.offline);
        assert!(config.ignore.use_defaults);
        assert!(config.ignore.default_patterns.contains(&".git".to_string()));
        assert_eq!(config.executor.shell, vec!["/bin/sh", "-c"]);
        assert_eq!(config.cache_dir(), config.home.join("cache"));
        assert_eq!(config.store_dir(), config.home.join("images"));
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = StrataConfig::from_yaml("offline: true\nlog_level: debug\n").unwrap();
        assert!(config.offline);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.store_max_bytes, DEFAULT_STORE_MAX_BYTES);
    }

    #[test]
    fn test_from_yaml_ignore_section() {
        let yaml = "ignore:\n  use_defaults: false\n  default_patterns: []\n";
        let config = StrataConfig::from_yaml(yaml).unwrap();
        assert!(!config.ignore.use_defaults);
        assert!(config.ignore.default_patterns.is_empty());
        assert_eq!(config.ignore.files, IgnoreConfig::default().files);
    }

    #[test]
    fn test_from_yaml_empty() {
        let config = StrataConfig::from_yaml("").unwrap();
        assert!(!config.offline);
    }

    #[test]
    fn test_from_yaml_invalid() {
        let err = StrataConfig::from_yaml("offline: [not, a, bool]").unwrap_err();
        assert!(matches!(err, StrataError::ConfigError(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let tmp = TempDir::new().unwrap();
        assert!(StrataConfig::from_file(&tmp.path().join("nope.yaml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            [("STRATA_HOME", "/srv/strata"), ("STRATA_OFFLINE", "true")].into();
        let mut config = StrataConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.home, PathBuf::from("/srv/strata"));
        assert!(config.offline);
    }

    #[test]
    fn test_env_override_offline_false() {
        let mut config = StrataConfig::from_yaml("offline: true").unwrap();
        config.apply_env_overrides(|k| (k == "STRATA_OFFLINE").then(|| "0".to_string()));
        assert!(!config.offline);
    }

    #[test]
    fn test_load_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "store_max_bytes: 1024\n").unwrap();
        let config = StrataConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store_max_bytes, 1024);
    }
}
