//! Isolated command execution for install and RUN steps.

use std::path::{Path, PathBuf};
#[cfg(target_os = "linux")]
use std::process::Stdio;

use async_trait::async_trait;
use strata_core::error::{Result, StrataError};
use strata_core::ExecutorConfig;

use super::buildfile::Command;
use super::context::StageContext;
use super::layer::{write_layer, DirSnapshot, LayerArchive};

/// A command to run inside a staging root filesystem.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Host path of the root filesystem the command sees as `/`
    pub rootfs: PathBuf,
    pub command: Command,
    pub context: StageContext,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr, for one-line diagnostics.
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("no output")
            .to_string()
    }
}

/// Runs build commands in isolation from the host filesystem.
///
/// A non-zero exit is reported through [`ExecOutput`]; `Err` means the
/// command could not be started at all.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Executes commands with `chroot` into the staging rootfs.
///
/// The environment is cleared and rebuilt from the step context, and the
/// process starts in the step's working directory.
pub struct ChrootExecutor {
    config: ExecutorConfig,
}

impl ChrootExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Argument vector executed inside the rootfs.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn argv(&self, command: &Command) -> Vec<String> {
        match command {
            Command::Shell(script) => {
                let mut argv = self.config.shell.clone();
                argv.push(script.clone());
                argv
            }
            Command::Exec(args) => args.clone(),
        }
    }
}

impl Default for ChrootExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

#[async_trait]
impl CommandExecutor for ChrootExecutor {
    #[cfg(target_os = "linux")]
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let workdir = request.context.workdir.as_str();
        let host_workdir = request.rootfs.join(request.context.workdir.relative());
        std::fs::create_dir_all(&host_workdir).map_err(|e| {
            StrataError::Other(format!(
                "Failed to create working directory {}: {}",
                workdir, e
            ))
        })?;

        let mut cmd = tokio::process::Command::new("chroot");
        cmd.arg(&request.rootfs)
            .arg("/bin/sh")
            .arg("-c")
            .arg(r#"cd "$0" && exec "$@""#)
            .arg(workdir)
            .args(self.argv(&request.command));

        cmd.env_clear();
        cmd.env(
            "PATH",
            request.context.env_var("PATH").unwrap_or(&self.config.path),
        );
        cmd.env("HOME", "/root");
        for (key, value) in &request.context.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            rootfs = %request.rootfs.display(),
            workdir,
            command = %request.command,
            "Executing build command"
        );

        let output = cmd.output().await.map_err(|e| {
            StrataError::Other(format!("Failed to execute `{}`: {}", request.command, e))
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput> {
        Err(StrataError::Other(format!(
            "cannot execute `{}`: isolated command execution requires a Linux host",
            request.command
        )))
    }
}

/// Run `request` and write what it changed in the rootfs as a layer.
///
/// `before` is the rootfs state the layer is diffed against. A non-zero
/// exit is turned into an error by `on_failure`.
pub async fn capture_layer<F>(
    executor: &dyn CommandExecutor,
    request: &ExecRequest,
    before: &DirSnapshot,
    output_path: &Path,
    on_failure: F,
) -> Result<LayerArchive>
where
    F: FnOnce(&ExecOutput) -> StrataError,
{
    let output = executor.execute(request).await?;
    if !output.success() {
        tracing::debug!(
            command = %request.command,
            exit_code = output.exit_code,
            stderr = %output.stderr,
            "Build command failed"
        );
        return Err(on_failure(&output));
    }

    let after = DirSnapshot::capture(&request.rootfs)?;
    let changes = before.diff(&after);
    tracing::debug!(
        command = %request.command,
        changes = changes.len(),
        "Captured command changes"
    );
    write_layer(&request.rootfs, &changes, output_path)
}
