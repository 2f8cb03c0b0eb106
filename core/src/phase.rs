//! Build stages and the per-build state machine.
//!
//! A build moves through
//! `Init -> BaseResolved -> DependenciesBuilt -> SourceOverlaid -> ContractDeclared -> EntrypointSet -> Built`.
//! Any stage failure moves it to `Failed`; `Built` and `Failed` are terminal.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// The kind of pipeline step being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    /// Base image resolution (`FROM`)
    Base,
    /// Working directory change (`WORKDIR`)
    Workdir,
    /// Environment change (`ENV`)
    Env,
    /// Manifest copy + install, one cacheable layer
    Dependencies,
    /// Standalone command (`RUN`)
    Run,
    /// Source tree copy (`COPY`)
    SourceOverlay,
    /// Exposed ports (`EXPOSE`)
    Contract,
    /// Entrypoint declaration (`ENTRYPOINT` / `CMD`)
    Entrypoint,
    /// Advisory labels (`LABEL`)
    Label,
    /// Final image assembly and tagging
    Assemble,
}

impl BuildStage {
    /// Phase reached once a step of this kind completes, if it advances one.
    pub fn completes(&self) -> Option<BuildPhase> {
        match self {
            BuildStage::Base => Some(BuildPhase::BaseResolved),
            BuildStage::Dependencies | BuildStage::Run => Some(BuildPhase::DependenciesBuilt),
            BuildStage::SourceOverlay => Some(BuildPhase::SourceOverlaid),
            BuildStage::Contract => Some(BuildPhase::ContractDeclared),
            BuildStage::Entrypoint => Some(BuildPhase::EntrypointSet),
            BuildStage::Workdir | BuildStage::Env | BuildStage::Label | BuildStage::Assemble => {
                None
            }
        }
    }

    /// Whether a step of this kind produces a filesystem layer.
    pub fn produces_layer(&self) -> bool {
        matches!(
            self,
            BuildStage::Base
                | BuildStage::Dependencies
                | BuildStage::Run
                | BuildStage::SourceOverlay
        )
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildStage::Base => "base",
            BuildStage::Workdir => "workdir",
            BuildStage::Env => "env",
            BuildStage::Dependencies => "dependencies",
            BuildStage::Run => "run",
            BuildStage::SourceOverlay => "source-overlay",
            BuildStage::Contract => "contract",
            BuildStage::Entrypoint => "entrypoint",
            BuildStage::Label => "label",
            BuildStage::Assemble => "assemble",
        };
        write!(f, "{}", name)
    }
}

/// State of a single build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildPhase {
    Init,
    BaseResolved,
    DependenciesBuilt,
    SourceOverlaid,
    ContractDeclared,
    EntrypointSet,
    Built,
    Failed,
}

impl BuildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Built | BuildPhase::Failed)
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildPhase::Init => "init",
            BuildPhase::BaseResolved => "base-resolved",
            BuildPhase::DependenciesBuilt => "dependencies-built",
            BuildPhase::SourceOverlaid => "source-overlaid",
            BuildPhase::ContractDeclared => "contract-declared",
            BuildPhase::EntrypointSet => "entrypoint-set",
            BuildPhase::Built => "built",
            BuildPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Tracks the phase of one build.
///
/// Steps may appear out of the canonical order in a build file; the phase
/// only ever moves forward, so it records the furthest stage reached.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: BuildPhase,
    transitions: Vec<BuildPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: BuildPhase::Init,
            transitions: vec![BuildPhase::Init],
        }
    }

    /// Current phase.
    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn transitions(&self) -> &[BuildPhase] {
        &self.transitions
    }

    /// Record that a step of `stage` completed.
    pub fn complete(&mut self, stage: BuildStage) -> Result<BuildPhase> {
        if self.phase.is_terminal() {
            return Err(StrataError::Other(format!(
                "cannot complete {} step: build already {}",
                stage, self.phase
            )));
        }

        match (self.phase, stage) {
            (BuildPhase::Init, BuildStage::Base) => {}
            (BuildPhase::Init, other) => {
                return Err(StrataError::Other(format!(
                    "{} step completed before the base image was resolved",
                    other
                )));
            }
            (_, BuildStage::Base) => {
                return Err(StrataError::Other(
                    "base image may only be resolved once per build".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(next) = stage.completes() {
            if next > self.phase {
                self.enter(next);
            }
        }
        Ok(self.phase)
    }

    /// Move to the terminal `Built` phase.
    pub fn finish(&mut self) -> Result<()> {
        if self.phase == BuildPhase::Init || self.phase.is_terminal() {
            return Err(StrataError::Other(format!(
                "cannot finish build from phase {}",
                self.phase
            )));
        }
        self.enter(BuildPhase::Built);
        Ok(())
    }

    /// Move to the terminal `Failed` phase.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.enter(BuildPhase::Failed);
        }
    }

    fn enter(&mut self, phase: BuildPhase) {
        tracing::debug!(from = %self.phase, to = %phase, "Build phase transition");
        self.phase = phase;
        self.transitions.push(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_reaches_built() {
        let mut tracker = PhaseTracker::new();
        tracker.complete(BuildStage::Base).unwrap();
        tracker.complete(BuildStage::Workdir).unwrap();
        tracker.complete(BuildStage::Dependencies).unwrap();
        tracker.complete(BuildStage::SourceOverlay).unwrap();
        tracker.complete(BuildStage::Contract).unwrap();
        tracker.complete(BuildStage::Entrypoint).unwrap();
        tracker.finish().unwrap();

        assert_eq!(
            tracker.transitions(),
            &[
                BuildPhase::Init,
                BuildPhase::BaseResolved,
                BuildPhase::DependenciesBuilt,
                BuildPhase::SourceOverlaid,
                BuildPhase::ContractDeclared,
                BuildPhase::EntrypointSet,
                BuildPhase::Built,
            ]
        );
    }

    #[test]
    fn test_step_before_base_is_rejected() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.complete(BuildStage::SourceOverlay).is_err());
    }

    #[test]
    fn test_second_base_is_rejected() {
        let mut tracker = PhaseTracker::new();
        tracker.complete(BuildStage::Base).unwrap();
        assert!(tracker.complete(BuildStage::Base).is_err());
    }

    #[test]
    fn test_phase_never_moves_backwards() {
        let mut tracker = PhaseTracker::new();
        tracker.complete(BuildStage::Base).unwrap();
        tracker.complete(BuildStage::Entrypoint).unwrap();
        let phase = tracker.complete(BuildStage::Contract).unwrap();
        assert_eq!(phase, BuildPhase::EntrypointSet);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = PhaseTracker::new();
        tracker.complete(BuildStage::Base).unwrap();
        tracker.fail();
        assert_eq!(tracker.phase(), BuildPhase::Failed);
        assert!(tracker.complete(BuildStage::Dependencies).is_err());
        assert!(tracker.finish().is_err());
    }

    #[test]
    fn test_finish_requires_base() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.finish().is_err());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(BuildStage::SourceOverlay.to_string(), "source-overlay");
        assert_eq!(BuildStage::Dependencies.to_string(), "dependencies");
    }

    #[test]
    fn test_layer_producing_stages() {
        assert!(BuildStage::Dependencies.produces_layer());
        assert!(BuildStage::SourceOverlay.produces_layer());
        assert!(!BuildStage::Contract.produces_layer());
        assert!(!BuildStage::Entrypoint.produces_layer());
    }
}
