//! Dependency layer: copy the manifest, run the installer, keep the delta.
//!
//! The layer is keyed by its parent, the instruction, the stage context and
//! the manifest itself. Nothing else in the build context takes part, so
//! editing application sources never invalidates installed packages.

use std::path::Path;

use strata_core::error::{Result, StrataError};
use strata_core::BuildStage;

use super::buildfile::Command;
use super::context::StageContext;
use super::digest::{CacheKey, KeyBuilder};
use super::exclude::IgnoreList;
use super::executor::{capture_layer, CommandExecutor, ExecOutput, ExecRequest};
use super::layer::{DirSnapshot, LayerArchive};
use super::manifest::Manifest;
use super::overlay::CopySet;

/// A prepared dependency install.
#[derive(Debug, Clone)]
pub struct DependencyStep {
    pub manifest: Manifest,
    /// The manifest file as it lands in the image
    pub copy: CopySet,
    pub command: Command,
}

impl DependencyStep {
    /// Read the manifest at `manifest_src` (relative to `context_dir`).
    pub fn prepare(
        context_dir: &Path,
        manifest_src: &str,
        dst: &str,
        command: &Command,
        context: &StageContext,
        ignore: &IgnoreList,
    ) -> Result<Self> {
        let copy = CopySet::collect(
            context_dir,
            &[manifest_src.to_string()],
            dst,
            &context.workdir,
            ignore,
        )?;
        let Some(entry) = copy.entries.first() else {
            return Err(StrataError::SourceCopy {
                path: manifest_src.to_string(),
                message: "manifest is excluded by the ignore list".to_string(),
            });
        };
        let manifest = Manifest::from_file(&entry.source)?;

        for (line, text) in &manifest.unrecognized {
            tracing::debug!(
                manifest = manifest_src,
                line,
                text = %text,
                "Unrecognized manifest line passed to installer"
            );
        }

        Ok(Self {
            manifest,
            copy,
            command: command.clone(),
        })
    }

    /// Cache key of the install layer built on `parent`.
    pub fn key(&self, parent: &CacheKey, instruction: &str, context: &StageContext) -> CacheKey {
        let builder = KeyBuilder::new(BuildStage::Dependencies)
            .parent(Some(parent))
            .field("instruction", instruction)
            .field("command", self.command.to_string())
            .field("workdir", context.workdir.as_str())
            .field("env", context.env_fingerprint())
            .field("manifest", self.manifest.raw());
        self.copy.fingerprint(builder).finish()
    }

    /// Install into `rootfs` and write the resulting delta to `output_path`.
    ///
    /// The layer contains the manifest and everything the installer wrote.
    pub async fn install(
        &self,
        executor: &dyn CommandExecutor,
        rootfs: &Path,
        context: &StageContext,
        output_path: &Path,
    ) -> Result<LayerArchive> {
        let before = DirSnapshot::capture(rootfs)?;
        self.copy.materialize(rootfs)?;

        tracing::info!(
            packages = self.manifest.requirements.len(),
            command = %self.command,
            "Installing dependencies"
        );

        let request = ExecRequest {
            rootfs: rootfs.to_path_buf(),
            command: self.command.clone(),
            context: context.clone(),
        };
        capture_layer(executor, &request, &before, output_path, |output| {
            self.install_error(output)
        })
        .await
    }

    fn install_error(&self, output: &ExecOutput) -> StrataError {
        let diagnostics = format!("{}\n{}", output.stderr, output.stdout);
        StrataError::DependencyInstall {
            package: self
                .manifest
                .find_mentioned(&diagnostics)
                .map(|r| r.name.clone()),
            message: format!("exit {}: {}", output.exit_code, output.summary()),
        }
    }
}
