use thiserror::Error;

use crate::phase::BuildStage;

/// Build-time error types.
///
/// Every failure raised while turning a build file into an image is one of
/// these. Failures that can only be observed when a container is started
/// live in [`StartError`] instead.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Build file could not be read or parsed
    #[error("Build file error: {0}")]
    BuildFile(String),

    /// Image reference is malformed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Declared port is outside 1-65535 or unparseable
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Dependency manifest could not be read or parsed
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Base image unreachable or unknown
    #[error("Resolution failed for {reference}: {message}")]
    Resolution { reference: String, message: String },

    /// Manifest unsatisfiable
    #[error("Dependency install failed: {message}")]
    DependencyInstall {
        package: Option<String>,
        message: String,
    },

    /// Source path unreadable or not permitted
    #[error("Source copy failed for {path}: {message}")]
    SourceCopy { path: String, message: String },

    /// A RUN command exited unsuccessfully
    #[error("Command `{command}` failed (exit {exit_code}): {message}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        message: String,
    },

    /// Layer archive creation or extraction error
    #[error("Layer error: {0}")]
    LayerError(String),

    /// Layer content cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Image store error
    #[error("Image store error: {0}")]
    StoreError(String),

    /// Build aborted at a stage boundary
    #[error("Build cancelled before {stage} step")]
    Cancelled { stage: BuildStage },

    /// A stage failed; carries the failing instruction's identity
    #[error("{stage} step failed at line {line} ({instruction}): {source}")]
    StageFailed {
        stage: BuildStage,
        line: usize,
        instruction: String,
        #[source]
        source: Box<StrataError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Attach the failing stage and instruction to this error.
    ///
    /// Errors already attributed to a stage are returned unchanged.
    pub fn at_stage(self, stage: BuildStage, line: usize, instruction: impl Into<String>) -> Self {
        match self {
            already @ StrataError::StageFailed { .. } => already,
            cancelled @ StrataError::Cancelled { .. } => cancelled,
            other => StrataError::StageFailed {
                stage,
                line,
                instruction: instruction.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping stage attribution.
    pub fn root_cause(&self) -> &StrataError {
        match self {
            StrataError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Stage the error was attributed to, if any.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            StrataError::StageFailed { stage, .. } => Some(*stage),
            StrataError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StrataError {
    fn from(err: serde_yaml::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Result of a build-time operation.
pub type BuildResult<T> = Result<T>;

/// Run-time error types, raised only when a container is instantiated.
#[derive(Error, Debug)]
pub enum StartError {
    /// The entrypoint program is absent from the composed filesystem
    #[error("Entrypoint not found: {program} (working directory {workdir})")]
    EntrypointNotFound { program: String, workdir: String },

    /// The image declares no entrypoint at all
    #[error("Image {0} declares no entrypoint")]
    NoEntrypoint(String),

    /// Image is not present in the local store
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Root filesystem could not be composed
    #[error("Rootfs error: {0}")]
    Rootfs(String),

    /// The runtime could not spawn the process
    #[error("Launch failed: {0}")]
    Launch(String),
}

/// Result of a run-time (container start) operation.
pub type ContainerStartResult<T> = std::result::Result<T, StartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display() {
        let error = StrataError::Resolution {
            reference: "docker.io/library/python:3.12".to_string(),
            message: "registry unreachable".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Resolution failed for docker.io/library/python:3.12: registry unreachable"
        );
    }

    #[test]
    fn test_dependency_install_error_display() {
        let error = StrataError::DependencyInstall {
            package: Some("pkgA".to_string()),
            message: "no matching distribution for pkgA==9.9".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Dependency install failed: no matching distribution for pkgA==9.9"
        );
    }

    #[test]
    fn test_stage_failed_is_one_line() {
        let error = StrataError::SourceCopy {
            path: "secret.txt".to_string(),
            message: "permission denied".to_string(),
        }
        .at_stage(BuildStage::SourceOverlay, 5, "COPY . .");

        let rendered = error.to_string();
        assert_eq!(
            rendered,
            "source-overlay step failed at line 5 (COPY . .): Source copy failed for secret.txt: permission denied"
        );
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn test_at_stage_does_not_double_wrap() {
        let error = StrataError::Other("boom".to_string())
            .at_stage(BuildStage::Dependencies, 3, "RUN pip install")
            .at_stage(BuildStage::SourceOverlay, 4, "COPY . .");
        assert_eq!(error.stage(), Some(BuildStage::Dependencies));
        assert!(matches!(error.root_cause(), StrataError::Other(_)));
    }

    #[test]
    fn test_cancelled_is_not_wrapped() {
        let error = StrataError::Cancelled {
            stage: BuildStage::Dependencies,
        }
        .at_stage(BuildStage::Dependencies, 3, "RUN pip install");
        assert!(matches!(error, StrataError::Cancelled { .. }));
        assert_eq!(error.to_string(), "Build cancelled before dependencies step");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StrataError = io_error.into();
        assert!(matches!(error, StrataError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: StrataError = result.unwrap_err().into();
        assert!(matches!(error, StrataError::SerializationError(_)));
    }

    #[test]
    fn test_entrypoint_not_found_display() {
        let error = StartError::EntrypointNotFound {
            program: "run".to_string(),
            workdir: "/app".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Entrypoint not found: run (working directory /app)"
        );
    }
}
