//! Strata Core - Foundational Types
//!
//! Error taxonomy, configuration, build phases and build events shared by
//! the strata runtime and CLI.

pub mod config;
pub mod error;
pub mod event;
pub mod phase;

// Re-export commonly used types
pub use config::{ExecutorConfig, IgnoreConfig, LogLevel, StrataConfig};
pub use error::{BuildResult, ContainerStartResult, Result, StartError, StrataError};
pub use event::{BuildEvent, EventEmitter, EventPayload};
pub use phase::{BuildPhase, BuildStage, PhaseTracker};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
