//! Build planning and linting.
//!
//! Lowers parsed instructions into the ordered steps the engine runs.
//! `COPY <manifest> <dst>` directly followed by a `RUN` that names the
//! manifest becomes one dependency step, so the install layer is keyed by
//! the manifest alone. Ports and entrypoints are validated here, before any
//! step executes.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use strata_core::error::Result;
use strata_core::BuildStage;

use super::buildfile::{BuildFile, Command, Instruction, Located};
use super::contract::{parse_port, ExposedPort};
use super::entrypoint::EntrypointCommand;
use super::manifest::Manifest;
use crate::oci::ImageReference;

/// What a step does.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Base {
        reference: ImageReference,
    },
    Workdir {
        path: String,
    },
    Env {
        vars: Vec<(String, String)>,
    },
    /// Manifest copy plus install, one layer
    Dependencies {
        /// Manifest path inside the build context
        manifest: String,
        dst: String,
        command: Command,
    },
    Run {
        command: Command,
    },
    Overlay {
        sources: Vec<String>,
        dst: String,
        /// Copies the whole build context
        whole_tree: bool,
    },
    Expose {
        ports: Vec<ExposedPort>,
    },
    Entrypoint {
        command: EntrypointCommand,
    },
    Label {
        key: String,
        value: String,
    },
}

/// One step of a build, with the instruction it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub line: usize,
    pub instruction: String,
    pub kind: StepKind,
}

impl Step {
    pub fn stage(&self) -> BuildStage {
        match self.kind {
            StepKind::Base { .. } => BuildStage::Base,
            StepKind::Workdir { .. } => BuildStage::Workdir,
            StepKind::Env { .. } => BuildStage::Env,
            StepKind::Dependencies { .. } => BuildStage::Dependencies,
            StepKind::Run { .. } => BuildStage::Run,
            StepKind::Overlay { .. } => BuildStage::SourceOverlay,
            StepKind::Expose { .. } => BuildStage::Contract,
            StepKind::Entrypoint { .. } => BuildStage::Entrypoint,
            StepKind::Label { .. } => BuildStage::Label,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub steps: Vec<Step>,
}

impl BuildPlan {
    pub fn base(&self) -> Option<&ImageReference> {
        self.steps.iter().find_map(|s| match &s.kind {
            StepKind::Base { reference } => Some(reference),
            _ => None,
        })
    }

    /// Number of steps that produce a filesystem layer, base excluded.
    pub fn layer_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.stage().produces_layer() && s.stage() != BuildStage::Base)
            .count()
    }
}

/// Lower a build file into steps, expanding `ARG` values.
///
/// `build_args` override the defaults of declared `ARG`s.
pub fn plan(file: &BuildFile, build_args: &HashMap<String, String>) -> Result<BuildPlan> {
    let mut args: HashMap<String, String> = HashMap::new();
    let mut steps = Vec::new();
    let mut instructions = file.instructions.iter().peekable();

    while let Some(located) = instructions.next() {
        let line = located.line;
        let text = located.text.clone();
        let step = |kind| Step {
            line,
            instruction: text.clone(),
            kind,
        };

        let kind = match &located.instruction {
            Instruction::Arg { name, default } => {
                let value = build_args
                    .get(name)
                    .cloned()
                    .or_else(|| default.as_ref().map(|d| expand(d, &args)));
                if let Some(value) = value {
                    args.insert(name.clone(), value);
                }
                continue;
            }
            Instruction::From { image } => {
                let reference = ImageReference::parse(&expand(image, &args))
                    .map_err(|e| e.at_stage(BuildStage::Base, line, &text))?;
                StepKind::Base { reference }
            }
            Instruction::Workdir { path } => StepKind::Workdir {
                path: expand(path, &args),
            },
            Instruction::Env { vars } => StepKind::Env {
                vars: vars
                    .iter()
                    .map(|(key, value)| (key.clone(), expand(value, &args)))
                    .collect(),
            },
            Instruction::Copy { src, dst } => {
                let sources: Vec<String> = src.iter().map(|s| expand(s, &args)).collect();
                let dst = expand(dst, &args);

                let fused = fuse_dependency_install(&sources, instructions.peek());
                if let Some((manifest, run, command)) = fused {
                    instructions.next();
                    steps.push(Step {
                        line,
                        instruction: format!("{}; {}", text, run.text),
                        kind: StepKind::Dependencies {
                            manifest,
                            dst,
                            command,
                        },
                    });
                    continue;
                }

                let whole_tree = sources.iter().any(|s| is_whole_tree(s));
                StepKind::Overlay {
                    sources,
                    dst,
                    whole_tree,
                }
            }
            Instruction::Run { command } => StepKind::Run {
                command: command.clone(),
            },
            Instruction::Expose { ports } => {
                let ports = ports
                    .iter()
                    .map(|p| parse_port(&expand(p, &args)))
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| e.at_stage(BuildStage::Contract, line, &text))?;
                StepKind::Expose { ports }
            }
            Instruction::Entrypoint { exec } | Instruction::Cmd { exec } => {
                let command = EntrypointCommand::new(exec.clone())
                    .map_err(|e| e.at_stage(BuildStage::Entrypoint, line, &text))?;
                StepKind::Entrypoint { command }
            }
            Instruction::Label { key, value } => StepKind::Label {
                key: key.clone(),
                value: expand(value, &args),
            },
        };
        steps.push(step(kind));
    }

    for name in build_args.keys() {
        if !args.contains_key(name) {
            tracing::warn!(arg = %name, "Build argument was not consumed by any ARG");
        }
    }

    Ok(BuildPlan { steps })
}

/// `COPY requirements.txt .` + `RUN pip install -r requirements.txt`
fn fuse_dependency_install<'a>(
    sources: &[String],
    next: Option<&&'a Located>,
) -> Option<(String, &'a Located, Command)> {
    let [manifest] = sources else {
        return None;
    };
    if is_whole_tree(manifest) || manifest.ends_with('/') {
        return None;
    }
    let next = *next?;
    let Instruction::Run { command } = &next.instruction else {
        return None;
    };
    let file_name = Path::new(manifest).file_name()?.to_str()?;
    command
        .mentions(file_name)
        .then(|| (manifest.clone(), next, command.clone()))
}

fn is_whole_tree(source: &str) -> bool {
    let trimmed = source.trim_end_matches('/');
    trimmed == "." || trimmed.is_empty()
}

/// Expand `${NAME}` and `$NAME` from declared build arguments. Unknown
/// names are left untouched.
fn expand(s: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match args.get(name) {
            Some(value) if !name.is_empty() => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Kind of lint finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintCode {
    /// Whole source tree copied before an install step
    SourceBeforeInstall,
    /// An earlier entrypoint declaration has no effect
    EntrypointOverridden,
    /// No entrypoint declared in the build file
    NoEntrypoint,
    /// Manifest entry without a pinned version
    FloatingVersion,
}

impl LintCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LintCode::SourceBeforeInstall => "source-before-install",
            LintCode::EntrypointOverridden => "entrypoint-overridden",
            LintCode::NoEntrypoint => "no-entrypoint",
            LintCode::FloatingVersion => "floating-version",
        }
    }
}

/// Advisory finding; never fails a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    pub line: usize,
    pub code: LintCode,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: [{}] {}", self.line, self.code.as_str(), self.message)
    }
}

/// Check a plan for cache-hostile ordering and ambiguous declarations.
///
/// With a `context_dir`, dependency manifests are read to flag unpinned
/// versions; unreadable manifests are skipped.
pub fn lint(plan: &BuildPlan, context_dir: Option<&Path>) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    let mut whole_tree_line: Option<usize> = None;
    let mut last_entrypoint: Option<usize> = None;

    for step in &plan.steps {
        match &step.kind {
            StepKind::Overlay {
                whole_tree: true, ..
            } => {
                whole_tree_line.get_or_insert(step.line);
            }
            StepKind::Dependencies { .. } | StepKind::Run { .. } => {
                if let Some(copy_line) = whole_tree_line {
                    warnings.push(LintWarning {
                        line: step.line,
                        code: LintCode::SourceBeforeInstall,
                        message: format!(
                            "runs after the whole source tree is copied (line {}); every source edit will re-run it",
                            copy_line
                        ),
                    });
                }
            }
            StepKind::Entrypoint { .. } => {
                if let Some(previous) = last_entrypoint.replace(step.line) {
                    warnings.push(LintWarning {
                        line: previous,
                        code: LintCode::EntrypointOverridden,
                        message: format!("entrypoint is overridden by line {}", step.line),
                    });
                }
            }
            _ => {}
        }

        if let (StepKind::Dependencies { manifest, .. }, Some(dir)) = (&step.kind, context_dir) {
            if let Ok(parsed) = Manifest::from_file(&dir.join(manifest)) {
                for req in parsed.floating() {
                    warnings.push(LintWarning {
                        line: step.line,
                        code: LintCode::FloatingVersion,
                        message: format!(
                            "{} line {}: '{}' does not pin a single version",
                            manifest, req.line, req
                        ),
                    });
                }
            }
        }
    }

    if last_entrypoint.is_none() {
        let line = plan
            .steps
            .iter()
            .find(|s| s.stage() == BuildStage::Base)
            .map(|s| s.line)
            .unwrap_or(1);
        warnings.push(LintWarning {
            line,
            code: LintCode::NoEntrypoint,
            message: "no ENTRYPOINT or CMD; the base image's command is used".to_string(),
        });
    }

    warnings.sort_by_key(|w| w.line);
    warnings
}
