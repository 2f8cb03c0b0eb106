//! Image build pipeline.
//!
//! A build file is parsed into instructions, lowered into a [`BuildPlan`]
//! and executed by the [`BuildEngine`]:
//!
//! - base image resolution (`FROM`)
//! - dependency install from a manifest (`COPY <manifest>` + `RUN`)
//! - source overlay (`COPY`)
//! - runtime contract (`EXPOSE`)
//! - entrypoint (`ENTRYPOINT` / `CMD`)
//!
//! Every layer is content-addressed and cached; see [`crate::cache`].

pub mod assemble;
pub mod buildfile;
pub mod context;
pub mod contract;
pub mod dependency;
pub mod digest;
pub mod engine;
pub mod entrypoint;
pub mod exclude;
pub mod executor;
pub mod layer;
pub mod manifest;
pub mod overlay;
pub mod plan;

pub use buildfile::{BuildFile, Command, Instruction, Located, DEFAULT_BUILD_FILES};
pub use context::{StageContext, WorkingDirectory};
pub use contract::{parse_port, ExposedPort, ExposedPortSet, Protocol};
pub use digest::{CacheKey, KeyBuilder};
pub use engine::{BuildEngine, BuildOutcome, BuildRequest, StepReport, StepStatus};
pub use entrypoint::{EntrypointCommand, ImageConfig, ImageSpec};
pub use exclude::IgnoreList;
pub use executor::{ChrootExecutor, CommandExecutor, ExecOutput, ExecRequest};
pub use manifest::{Manifest, Requirement};
pub use plan::{lint, plan, BuildPlan, LintCode, LintWarning, Step, StepKind};
