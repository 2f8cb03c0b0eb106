//! Strata Runtime - image build pipeline.
//!
//! Build-file parsing and planning, base image resolution, the
//! content-addressed layer cache, the build stages and engine, the local
//! image store, and container start for built images.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod container;
pub mod oci;

// Re-export common types
pub use build::{
    lint, plan, BuildEngine, BuildFile, BuildOutcome, BuildPlan, BuildRequest, CacheKey,
    ChrootExecutor, CommandExecutor, ImageSpec, LintWarning, StepStatus,
};
pub use cache::{CachedLayer, Layer, LayerCache};
pub use container::{ContainerHandle, ContainerRuntime, LaunchSpec, LocalRuntime};
pub use oci::{BaseImage, BaseImageResolver, StoreResolver};
pub use oci::{ImageReference, ImageSource, ImageStore, OciImage, OciImageConfig, StoredImage};
pub use oci::{RegistryAuth, RegistryPuller};

/// Strata runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
