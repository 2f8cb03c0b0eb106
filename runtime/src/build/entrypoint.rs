//! Entrypoint declaration and the resulting image description.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use strata_core::error::{Result, StrataError};

use super::context::{StageContext, WorkingDirectory};
use super::contract::ExposedPortSet;
use crate::cache::Layer;
use crate::oci::OciImageConfig;

/// The argument vector a container runs as its first process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrypointCommand(Vec<String>);

impl EntrypointCommand {
    /// Non-empty argument vector with a non-empty program.
    pub fn new(argv: Vec<String>) -> Result<Self> {
        match argv.first() {
            Some(program) if !program.is_empty() => Ok(Self(argv)),
            _ => Err(StrataError::BuildFile(
                "entrypoint must name a program".to_string(),
            )),
        }
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for EntrypointCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Run-time configuration accumulated over a build.
#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    pub workdir: WorkingDirectory,
    pub env: Vec<(String, String)>,
    pub entrypoint: Option<EntrypointCommand>,
    pub exposed_ports: ExposedPortSet,
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    /// Start from what the base image declares.
    pub fn from_base(base: &OciImageConfig) -> Self {
        Self {
            workdir: base
                .working_dir
                .as_deref()
                .filter(|wd| !wd.is_empty())
                .map(WorkingDirectory::new)
                .unwrap_or_default(),
            env: base.env.clone(),
            entrypoint: EntrypointCommand::new(base.command()).ok(),
            exposed_ports: ExposedPortSet::from_config_keys(&base.exposed_ports),
            labels: base
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// The context the first step after `FROM` sees.
    pub fn stage_context(&self) -> StageContext {
        StageContext::new(self.workdir.clone(), self.env.clone())
    }

    /// Declare the entrypoint. Last write wins; returns the replaced one.
    pub fn set_entrypoint(&mut self, command: EntrypointCommand) -> Option<EntrypointCommand> {
        self.entrypoint.replace(command)
    }
}

/// A built, tagged image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSpec {
    /// Manifest digest ("sha256:...")
    pub id: String,
    /// Normalized tag reference
    pub reference: String,
    /// Base image reference
    pub base: String,
    /// Layers this build produced (or reused), bottom to top
    pub layers: Vec<Layer>,
    pub workdir: String,
    pub entrypoint: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl ImageSpec {
    pub fn new(
        id: String,
        reference: String,
        base: String,
        layers: Vec<Layer>,
        config: &ImageConfig,
    ) -> Self {
        Self {
            id,
            reference,
            base,
            layers,
            workdir: config.workdir.to_string(),
            entrypoint: config
                .entrypoint
                .as_ref()
                .map(|e| e.argv().to_vec())
                .unwrap_or_default(),
            exposed_ports: config.exposed_ports.config_keys(),
            env: config
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels: config.labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_entrypoint_requires_program() {
        assert!(EntrypointCommand::new(vec![]).is_err());
        assert!(EntrypointCommand::new(argv(&[""])).is_err());
        let cmd = EntrypointCommand::new(argv(&["run", "app.py"])).unwrap();
        assert_eq!(cmd.program(), "run");
        assert_eq!(cmd.args(), &["app.py".to_string()]);
    }

    #[test]
    fn test_set_entrypoint_last_write_wins() {
        let mut config = ImageConfig::default();
        let first = EntrypointCommand::new(argv(&["python", "old.py"])).unwrap();
        let second = EntrypointCommand::new(argv(&["run", "app.py"])).unwrap();

        assert!(config.set_entrypoint(first.clone()).is_none());
        assert_eq!(config.set_entrypoint(second.clone()), Some(first));
        assert_eq!(config.entrypoint, Some(second));
    }

    #[test]
    fn test_from_base_inherits_config() {
        let base = OciImageConfig {
            entrypoint: Some(argv(&["python3"])),
            cmd: Some(argv(&["-V"])),
            env: vec![("PATH".to_string(), "/usr/bin".to_string())],
            working_dir: Some("/srv".to_string()),
            exposed_ports: vec!["8080/tcp".to_string()],
            ..Default::default()
        };
        let config = ImageConfig::from_base(&base);
        assert_eq!(config.workdir.as_str(), "/srv");
        assert_eq!(config.entrypoint.unwrap().argv(), &argv(&["python3", "-V"])[..]);
        assert!(config.exposed_ports.contains(8080));
        assert_eq!(config.env.len(), 1);
    }

    #[test]
    fn test_from_base_without_command() {
        let config = ImageConfig::from_base(&OciImageConfig::default());
        assert!(config.entrypoint.is_none());
        assert_eq!(config.workdir, WorkingDirectory::root());
    }
}
