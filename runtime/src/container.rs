//! Container start for built images.
//!
//! Failures here are run-time failures ([`StartError`]), separate from
//! anything raised while building. An entrypoint that names a program the
//! image does not contain builds fine and fails only when a container is
//! started from it.

use std::path::{Path, PathBuf};
#[cfg(target_os = "linux")]
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use strata_core::error::{ContainerStartResult, StartError};
use tempfile::TempDir;

use crate::build::context::WorkingDirectory;
use crate::oci::{extract_layer, ImageReference, ImageStore, OciImage, StoredImage};

/// PATH used when the image does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Symlink hops followed before a path is considered unresolvable.
const MAX_SYMLINK_HOPS: usize = 40;

/// A container ready to launch: composed rootfs plus resolved entrypoint.
#[derive(Debug)]
pub struct LaunchSpec {
    /// Image reference the container was started from
    pub image: String,
    /// Manifest digest of the image
    pub digest: String,
    /// Entrypoint program, resolved to a path inside the image
    pub program: String,
    /// Full argument vector as declared
    pub argv: Vec<String>,
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub exposed_ports: Vec<String>,
    rootfs: TempDir,
}

impl LaunchSpec {
    /// Host path of the composed root filesystem.
    pub fn rootfs(&self) -> &Path {
        self.rootfs.path()
    }
}

/// A running container.
pub struct ContainerHandle {
    pub id: String,
    spec: LaunchSpec,
    child: tokio::process::Child,
}

impl ContainerHandle {
    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the entrypoint to exit and return its exit code.
    pub async fn wait(&mut self) -> ContainerStartResult<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| StartError::Launch(format!("Failed to wait for {}: {}", self.id, e)))?;
        tracing::info!(id = %self.id, code = ?status.code(), "Container exited");
        Ok(status.code().unwrap_or(-1))
    }

    /// Kill the entrypoint process.
    pub async fn kill(&mut self) -> ContainerStartResult<()> {
        self.child
            .kill()
            .await
            .map_err(|e| StartError::Launch(format!("Failed to kill {}: {}", self.id, e)))
    }
}

/// Starts containers from images in the local store.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, image: &str) -> ContainerStartResult<ContainerHandle>;
}

/// Runs containers as `chroot`ed processes on the local host.
pub struct LocalRuntime {
    store: Arc<ImageStore>,
    /// Parent directory for composed root filesystems
    work_dir: PathBuf,
}

impl LocalRuntime {
    pub fn new(store: Arc<ImageStore>, work_dir: &Path) -> Self {
        Self {
            store,
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// Find `image` by reference or manifest digest.
    pub async fn lookup(&self, image: &str) -> ContainerStartResult<StoredImage> {
        if image.starts_with("sha256:") {
            if let Some(found) = self.store.get_by_digest(image).await {
                return Ok(found);
            }
        }
        if let Ok(reference) = ImageReference::parse(image) {
            if let Some(found) = self.store.get(&reference.full_reference()).await {
                return Ok(found);
            }
        }
        Err(StartError::ImageNotFound(image.to_string()))
    }

    /// Compose the image's root filesystem and resolve its entrypoint.
    pub async fn prepare(&self, image: &str) -> ContainerStartResult<LaunchSpec> {
        let stored = self.lookup(image).await?;
        let oci = OciImage::from_path(&stored.path)
            .map_err(|e| StartError::Rootfs(format!("Failed to load {}: {}", image, e)))?;
        let config = oci.config();

        let argv = config.command();
        let Some(program) = argv.first().filter(|p| !p.is_empty()).cloned() else {
            return Err(StartError::NoEntrypoint(stored.reference.clone()));
        };
        let workdir = config
            .working_dir
            .as_deref()
            .filter(|w| !w.is_empty())
            .unwrap_or("/")
            .to_string();

        std::fs::create_dir_all(&self.work_dir).map_err(|e| {
            StartError::Rootfs(format!(
                "Failed to create {}: {}",
                self.work_dir.display(),
                e
            ))
        })?;
        let rootfs = tempfile::Builder::new()
            .prefix("container-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| StartError::Rootfs(format!("Failed to create rootfs: {}", e)))?;
        for layer in oci.layers() {
            extract_layer(&layer.path, rootfs.path()).map_err(|e| {
                StartError::Rootfs(format!("Failed to extract {}: {}", layer.digest, e))
            })?;
        }

        let path_var = config.env_var("PATH").unwrap_or(DEFAULT_PATH);
        let resolved = resolve_entrypoint(rootfs.path(), &program, &workdir, path_var)?;

        tracing::debug!(
            image = %stored.reference,
            program = %program,
            resolved = %resolved,
            workdir = %workdir,
            "Entrypoint resolved"
        );

        Ok(LaunchSpec {
            image: stored.reference.clone(),
            digest: stored.digest.clone(),
            program: resolved,
            argv,
            workdir,
            env: config.env.clone(),
            exposed_ports: config.exposed_ports.clone(),
            rootfs,
        })
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn run(&self, image: &str) -> ContainerStartResult<ContainerHandle> {
        let spec = self.prepare(image).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let child = spawn(&spec)?;
        tracing::info!(
            id = %id,
            image = %spec.image,
            program = %spec.program,
            pid = ?child.id(),
            "Container started"
        );
        Ok(ContainerHandle { id, spec, child })
    }
}

#[cfg(target_os = "linux")]
fn spawn(spec: &LaunchSpec) -> ContainerStartResult<tokio::process::Child> {
    let mut cmd = tokio::process::Command::new("chroot");
    cmd.arg(spec.rootfs())
        .arg("/bin/sh")
        .arg("-c")
        .arg(r#"cd "$0" && exec "$@""#)
        .arg(&spec.workdir)
        .arg(&spec.program)
        .args(spec.argv.iter().skip(1));
    cmd.env_clear();
    if !spec.env.iter().any(|(k, _)| k == "PATH") {
        cmd.env("PATH", DEFAULT_PATH);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd.spawn()
        .map_err(|e| StartError::Launch(format!("Failed to start {}: {}", spec.program, e)))
}

#[cfg(not(target_os = "linux"))]
fn spawn(spec: &LaunchSpec) -> ContainerStartResult<tokio::process::Child> {
    Err(StartError::Launch(format!(
        "cannot start {}: containers require a Linux host",
        spec.program
    )))
}

/// Resolve `program` to an executable path inside `rootfs`.
///
/// Names without a slash are searched on `path_var`; anything else is taken
/// relative to `workdir`. A script's `#!` interpreter must exist too.
pub fn resolve_entrypoint(
    rootfs: &Path,
    program: &str,
    workdir: &str,
    path_var: &str,
) -> ContainerStartResult<String> {
    let not_found = |name: &str| StartError::EntrypointNotFound {
        program: name.to_string(),
        workdir: workdir.to_string(),
    };

    let candidates: Vec<String> = if program.contains('/') {
        vec![WorkingDirectory::new(workdir).resolve(program)]
    } else {
        path_var
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| WorkingDirectory::new(workdir).resolve(dir))
            .map(|dir| format!("{}/{}", dir.trim_end_matches('/'), program))
            .collect()
    };

    let (image_path, host_path) = candidates
        .into_iter()
        .find_map(|candidate| {
            let host = resolve_in_root(rootfs, &candidate)?;
            is_executable(&host).then_some((candidate, host))
        })
        .ok_or_else(|| not_found(program))?;

    if let Some(interpreter) = shebang_interpreter(&host_path) {
        let present = resolve_in_root(rootfs, &interpreter)
            .map(|host| is_executable(&host))
            .unwrap_or(false);
        if !present {
            return Err(not_found(&interpreter));
        }
    }

    Ok(image_path)
}

/// Host path of `image_path` inside `rootfs`, following symlinks without
/// leaving the rootfs. `None` if any component is missing.
fn resolve_in_root(rootfs: &Path, image_path: &str) -> Option<PathBuf> {
    let mut pending: Vec<String> = image_path
        .split('/')
        .filter(|p| !p.is_empty())
        .rev()
        .map(str::to_string)
        .collect();
    let mut current: Vec<String> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "." => continue,
            ".." => {
                current.pop();
                continue;
            }
            _ => current.push(part),
        }

        let host = rootfs.join(current.join("/"));
        let metadata = host.symlink_metadata().ok()?;
        if metadata.file_type().is_symlink() {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return None;
            }
            let target = std::fs::read_link(&host).ok()?;
            let target = target.to_string_lossy();
            current.pop();
            if target.starts_with('/') {
                current.clear();
            }
            pending.extend(
                target
                    .split('/')
                    .filter(|p| !p.is_empty())
                    .rev()
                    .map(str::to_string),
            );
        }
    }

    Some(rootfs.join(current.join("/")))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Interpreter named by a `#!` line, if the file has one.
fn shebang_interpreter(path: &Path) -> Option<String> {
    use std::io::Read;

    let mut head = [0u8; 256];
    let mut file = std::fs::File::open(path).ok()?;
    let n = file.read(&mut head).ok()?;
    let head = &head[..n];
    let line = head.strip_prefix(b"#!")?;
    let end = line.iter().position(|&b| b == b'\n').unwrap_or(line.len());
    let line = String::from_utf8_lossy(&line[..end]);
    line.split_whitespace().next().map(str::to_string)
}
