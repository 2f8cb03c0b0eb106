//! Build engine: runs a plan step by step and assembles the image.
//!
//! Steps execute strictly in declaration order. Each layer-producing step
//! computes its cache key from its parent key and inputs; a hit reuses the
//! cached layer, a miss runs the step in a staging root filesystem and
//! publishes the delta. The image is tagged only after every step and the
//! assembly succeeded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use strata_core::error::{BuildResult, Result, StrataError};
use strata_core::event::events;
use strata_core::{BuildEvent, BuildPhase, BuildStage, EventEmitter, IgnoreConfig, PhaseTracker};
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;

use super::assemble::{assemble, created_timestamp, Assembly};
use super::buildfile::{BuildFile, Command, DEFAULT_BUILD_FILES};
use super::context::StageContext;
use super::contract::declare;
use super::dependency::DependencyStep;
use super::digest::{CacheKey, KeyBuilder};
use super::entrypoint::{ImageConfig, ImageSpec};
use super::exclude::IgnoreList;
use super::executor::{capture_layer, CommandExecutor, ExecRequest};
use super::layer::{pack_dir, DirSnapshot, LayerArchive};
use super::overlay::CopySet;
use super::plan::{lint, plan, LintWarning, Step, StepKind};
use crate::cache::{CachedLayer, Layer, LayerCache};
use crate::oci::{extract_layer, BaseImage, BaseImageResolver, HistoryRecord, ImageReference, ImageStore, StoredImage};

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Build file; defaults to the first of [`DEFAULT_BUILD_FILES`] in the context
    pub build_file: Option<PathBuf>,
    /// Tag for the resulting image
    pub tag: String,
    /// Values for declared `ARG`s
    pub build_args: HashMap<String, String>,
    /// Re-run every step; results are still published
    pub no_cache: bool,
}

impl BuildRequest {
    pub fn new(context_dir: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            context_dir: context_dir.into(),
            build_file: None,
            tag: tag.into(),
            build_args: HashMap::new(),
            no_cache: false,
        }
    }

    fn build_file_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.build_file {
            return Ok(path.clone());
        }
        DEFAULT_BUILD_FILES
            .iter()
            .map(|name| self.context_dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                StrataError::BuildFile(format!(
                    "no build file found in {} (looked for {})",
                    self.context_dir.display(),
                    DEFAULT_BUILD_FILES.join(", ")
                ))
            })
    }
}

/// How a step was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Base image resolved
    Resolved,
    /// Layer reused from the cache
    Cached,
    /// Layer built and published
    Built,
    /// Configuration-only step
    Applied,
}

/// Record of one executed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub line: usize,
    pub instruction: String,
    pub stage: BuildStage,
    pub status: StepStatus,
    pub key: Option<CacheKey>,
    pub duration_ms: u64,
}

/// A successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image: ImageSpec,
    pub stored: StoredImage,
    /// Phases entered, `Init` through `Built`
    pub transitions: Vec<BuildPhase>,
    pub steps: Vec<StepReport>,
    pub warnings: Vec<LintWarning>,
}

impl BuildOutcome {
    pub fn cache_hits(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Cached)
            .count()
    }

    pub fn layers_built(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Built)
            .count()
    }
}

/// Runs builds against shared collaborators.
pub struct BuildEngine {
    resolver: Arc<dyn BaseImageResolver>,
    executor: Arc<dyn CommandExecutor>,
    cache: Arc<LayerCache>,
    store: Arc<ImageStore>,
    ignore: IgnoreConfig,
    events: EventEmitter,
}

impl BuildEngine {
    pub fn new(
        resolver: Arc<dyn BaseImageResolver>,
        executor: Arc<dyn CommandExecutor>,
        cache: Arc<LayerCache>,
        store: Arc<ImageStore>,
    ) -> Self {
        Self {
            resolver,
            executor,
            cache,
            store,
            ignore: IgnoreConfig::default(),
            events: EventEmitter::default(),
        }
    }

    pub fn with_ignore(mut self, ignore: IgnoreConfig) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Build and tag an image. Checks `cancel` before every step.
    pub async fn build(
        &self,
        request: BuildRequest,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let started = Instant::now();
        let tag = ImageReference::parse(&request.tag)?;
        let build_file_path = request.build_file_path()?;
        let file = BuildFile::from_file(&build_file_path)?;
        let plan = plan(&file, &request.build_args)?;

        let warnings = lint(&plan, Some(&request.context_dir));
        for warning in &warnings {
            tracing::warn!(
                line = warning.line,
                code = warning.code.as_str(),
                "{}",
                warning.message
            );
            self.events.emit(BuildEvent::with_string(
                events::LINT_WARNING,
                warning.to_string(),
            ));
        }

        let ignore = IgnoreList::load(&request.context_dir, &self.ignore)?;

        tracing::info!(
            tag = %tag,
            file = %build_file_path.display(),
            steps = plan.steps.len(),
            no_cache = request.no_cache,
            "Build started"
        );
        self.events.emit(BuildEvent::with_map(
            events::BUILD_STARTED,
            HashMap::from([
                ("tag".to_string(), serde_json::json!(tag.full_reference())),
                ("steps".to_string(), serde_json::json!(plan.steps.len())),
            ]),
        ));

        let mut run = BuildRun {
            engine: self,
            request: &request,
            ignore,
            tracker: PhaseTracker::new(),
            base: None,
            config: ImageConfig::default(),
            context: StageContext::default(),
            parent: None,
            chain: Vec::new(),
            history: Vec::new(),
            staging: None,
            reports: Vec::new(),
        };

        let result = run.execute(&plan.steps, &tag, &cancel).await;
        match result {
            Ok(stored) => {
                let base = run.base.as_ref().map(|b| b.reference.full_reference());
                let image = ImageSpec::new(
                    stored.digest.clone(),
                    tag.full_reference(),
                    base.unwrap_or_default(),
                    run.chain.iter().map(|c| c.layer.clone()).collect(),
                    &run.config,
                );
                let outcome = BuildOutcome {
                    image,
                    stored,
                    transitions: run.tracker.transitions().to_vec(),
                    steps: run.reports,
                    warnings,
                };

                tracing::info!(
                    tag = %tag,
                    digest = %outcome.image.id,
                    cached = outcome.cache_hits(),
                    built = outcome.layers_built(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Build completed"
                );
                self.events.emit(BuildEvent::with_map(
                    events::BUILD_COMPLETED,
                    HashMap::from([
                        ("tag".to_string(), serde_json::json!(tag.full_reference())),
                        ("digest".to_string(), serde_json::json!(outcome.image.id)),
                    ]),
                ));
                Ok(outcome)
            }
            Err(e) => {
                run.tracker.fail();
                tracing::error!(tag = %tag, error = %e, "Build failed");
                let mut payload = HashMap::from([
                    ("tag".to_string(), serde_json::json!(tag.full_reference())),
                    ("error".to_string(), serde_json::json!(e.to_string())),
                ]);
                if let Some(stage) = e.stage() {
                    payload.insert("stage".to_string(), serde_json::json!(stage));
                }
                self.events
                    .emit(BuildEvent::with_map(events::BUILD_FAILED, payload));
                Err(e)
            }
        }
    }
}

/// Root filesystem a cache miss executes in, composed lazily.
struct Staging {
    dir: TempDir,
    /// Leading layers (base first, then built) already extracted
    applied: usize,
}

/// Mutable state of one build.
struct BuildRun<'a> {
    engine: &'a BuildEngine,
    request: &'a BuildRequest,
    ignore: IgnoreList,
    tracker: PhaseTracker,
    base: Option<BaseImage>,
    config: ImageConfig,
    context: StageContext,
    /// Key the next layer chains from
    parent: Option<CacheKey>,
    chain: Vec<CachedLayer>,
    history: Vec<HistoryRecord>,
    staging: Option<Staging>,
    reports: Vec<StepReport>,
}

impl BuildRun<'_> {
    async fn execute(
        &mut self,
        steps: &[Step],
        tag: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<StoredImage> {
        for step in steps {
            let stage = step.stage();
            if cancel.is_cancelled() {
                tracing::warn!(stage = %stage, line = step.line, "Build cancelled");
                return Err(StrataError::Cancelled { stage });
            }

            self.engine.events.emit(step_event(events::STEP_STARTED, step, None));
            tracing::debug!(stage = %stage, line = step.line, instruction = %step.instruction, "Step started");

            let started = Instant::now();
            let (status, key) = self
                .run_step(step)
                .await
                .map_err(|e| e.at_stage(stage, step.line, &step.instruction))?;
            self.tracker.complete(stage)?;

            if stage != BuildStage::Base {
                self.history.push(HistoryRecord {
                    created_by: step.instruction.clone(),
                    empty_layer: status == StepStatus::Applied,
                });
            }
            self.reports.push(StepReport {
                line: step.line,
                instruction: step.instruction.clone(),
                stage,
                status,
                key,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            self.engine
                .events
                .emit(step_event(events::STEP_COMPLETED, step, Some(status)));
        }

        if cancel.is_cancelled() {
            return Err(StrataError::Cancelled {
                stage: BuildStage::Assemble,
            });
        }

        let base = self.base.as_ref().ok_or_else(|| {
            StrataError::BuildFile("build file does not resolve a base image".to_string())
        })?;
        let assembly = Assembly {
            base,
            layers: &self.chain,
            config: &self.config,
            history: &self.history,
            created: created_timestamp(),
        };
        let last_line = steps.last().map(|s| s.line).unwrap_or(0);
        let stored = assemble(&self.engine.store, tag, &assembly)
            .await
            .map_err(|e| e.at_stage(BuildStage::Assemble, last_line, tag.full_reference()))?;

        self.tracker.finish()?;
        Ok(stored)
    }

    async fn run_step(&mut self, step: &Step) -> Result<(StepStatus, Option<CacheKey>)> {
        match &step.kind {
            StepKind::Base { reference } => {
                let base = self.engine.resolver.resolve(reference).await?;
                tracing::info!(
                    reference = %base.reference,
                    digest = %base.manifest_digest,
                    layers = base.layers.len(),
                    "Base image resolved"
                );
                self.engine.events.emit(BuildEvent::with_map(
                    events::BASE_RESOLVED,
                    HashMap::from([
                        (
                            "reference".to_string(),
                            serde_json::json!(base.reference.full_reference()),
                        ),
                        ("digest".to_string(), serde_json::json!(base.manifest_digest)),
                    ]),
                ));
                self.config = ImageConfig::from_base(&base.config);
                self.context = self.config.stage_context();
                self.parent = Some(base.key.clone());
                let key = base.key.clone();
                self.base = Some(base);
                Ok((StepStatus::Resolved, Some(key)))
            }
            StepKind::Workdir { path } => {
                self.context = self.context.clone().with_workdir(path);
                self.config.workdir = self.context.workdir.clone();
                Ok((StepStatus::Applied, None))
            }
            StepKind::Env { vars } => {
                self.context = vars
                    .iter()
                    .fold(self.context.clone(), |ctx, (key, value)| ctx.with_env(key, value));
                self.config.env = self.context.env.clone();
                Ok((StepStatus::Applied, None))
            }
            StepKind::Dependencies {
                manifest,
                dst,
                command,
            } => self.dependencies(step, manifest, dst, command).await,
            StepKind::Run { command } => self.run_command(step, command).await,
            StepKind::Overlay { sources, dst, .. } => self.overlay(step, sources, dst),
            StepKind::Expose { ports } => {
                self.config.exposed_ports = declare(&self.config.exposed_ports, ports);
                Ok((StepStatus::Applied, None))
            }
            StepKind::Entrypoint { command } => {
                if let Some(previous) = self.config.set_entrypoint(command.clone()) {
                    tracing::debug!(previous = %previous, entrypoint = %command, "Entrypoint replaced");
                }
                Ok((StepStatus::Applied, None))
            }
            StepKind::Label { key, value } => {
                self.config.labels.insert(key.clone(), value.clone());
                Ok((StepStatus::Applied, None))
            }
        }
    }

    async fn dependencies(
        &mut self,
        step: &Step,
        manifest: &str,
        dst: &str,
        command: &Command,
    ) -> Result<(StepStatus, Option<CacheKey>)> {
        let deps = DependencyStep::prepare(
            &self.request.context_dir,
            manifest,
            dst,
            command,
            &self.context,
            &self.ignore,
        )?;
        let parent = self.parent()?;
        let key = deps.key(&parent, &step.instruction, &self.context);
        if let Some(hit) = self.lookup(&key, step)? {
            return Ok(hit);
        }

        let staged = self.engine.cache.staging_file()?;
        let rootfs = self.rootfs()?;
        let archive = deps
            .install(
                self.engine.executor.as_ref(),
                &rootfs,
                &self.context,
                staged.path(),
            )
            .await?;
        self.publish(key, step, archive, staged, true)
    }

    async fn run_command(
        &mut self,
        step: &Step,
        command: &Command,
    ) -> Result<(StepStatus, Option<CacheKey>)> {
        let parent = self.parent()?;
        let key = KeyBuilder::new(BuildStage::Run)
            .parent(Some(&parent))
            .field("instruction", &step.instruction)
            .field("command", command.to_string())
            .field("workdir", self.context.workdir.as_str())
            .field("env", self.context.env_fingerprint())
            .finish();
        if let Some(hit) = self.lookup(&key, step)? {
            return Ok(hit);
        }

        let staged = self.engine.cache.staging_file()?;
        let rootfs = self.rootfs()?;
        let before = DirSnapshot::capture(&rootfs)?;
        let request = ExecRequest {
            rootfs,
            command: command.clone(),
            context: self.context.clone(),
        };
        let archive = capture_layer(
            self.engine.executor.as_ref(),
            &request,
            &before,
            staged.path(),
            |output| StrataError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                message: output.summary(),
            },
        )
        .await?;
        self.publish(key, step, archive, staged, true)
    }

    fn overlay(
        &mut self,
        step: &Step,
        sources: &[String],
        dst: &str,
    ) -> Result<(StepStatus, Option<CacheKey>)> {
        let copy = CopySet::collect(
            &self.request.context_dir,
            sources,
            dst,
            &self.context.workdir,
            &self.ignore,
        )?;
        let parent = self.parent()?;
        let builder = KeyBuilder::new(BuildStage::SourceOverlay)
            .parent(Some(&parent))
            .field("instruction", &step.instruction)
            .field("workdir", self.context.workdir.as_str())
            .field("env", self.context.env_fingerprint());
        let key = copy.fingerprint(builder).finish();
        if let Some(hit) = self.lookup(&key, step)? {
            return Ok(hit);
        }

        tracing::debug!(files = copy.entries.len(), "Copying sources");
        let delta = self.engine.cache.staging_dir("overlay-")?;
        copy.materialize(delta.path())?;
        let staged = self.engine.cache.staging_file()?;
        let archive = pack_dir(delta.path(), staged.path())?;
        self.publish(key, step, archive, staged, false)
    }

    fn parent(&self) -> Result<CacheKey> {
        self.parent.clone().ok_or_else(|| {
            StrataError::BuildFile("layer step runs before the base image is resolved".to_string())
        })
    }

    /// Reuse a cached layer for `key`, unless caching is disabled.
    fn lookup(
        &mut self,
        key: &CacheKey,
        step: &Step,
    ) -> Result<Option<(StepStatus, Option<CacheKey>)>> {
        let cached = if self.request.no_cache {
            None
        } else {
            self.engine.cache.get(key)?
        };

        let Some(cached) = cached else {
            tracing::debug!(key = %key.short(), line = step.line, "Layer cache miss");
            self.engine.events.emit(BuildEvent::with_map(
                events::LAYER_CACHE_MISS,
                layer_payload(key, step),
            ));
            return Ok(None);
        };

        tracing::info!(key = %key.short(), line = step.line, "Layer cache hit");
        self.engine.events.emit(BuildEvent::with_map(
            events::LAYER_CACHE_HIT,
            layer_payload(key, step),
        ));
        self.parent = Some(key.clone());
        self.chain.push(cached);
        Ok(Some((StepStatus::Cached, Some(key.clone()))))
    }

    /// Register a freshly built layer and chain it.
    ///
    /// `in_rootfs` is true when the staging rootfs already holds the
    /// layer's changes.
    fn publish(
        &mut self,
        key: CacheKey,
        step: &Step,
        archive: LayerArchive,
        staged: NamedTempFile,
        in_rootfs: bool,
    ) -> Result<(StepStatus, Option<CacheKey>)> {
        let layer = Layer {
            key: key.clone(),
            parent: self.parent.clone(),
            kind: step.stage(),
            instruction: step.instruction.clone(),
            digest: format!("sha256:{}", archive.digest),
            diff_id: format!("sha256:{}", archive.diff_id),
            size: archive.size,
            created: Utc::now(),
        };
        let cached = self.engine.cache.publish(layer, staged)?;

        tracing::info!(
            key = %key.short(),
            digest = %cached.layer.digest,
            size = cached.layer.size,
            "Layer built"
        );

        self.parent = Some(key.clone());
        self.chain.push(cached);
        let count = self.layer_count();
        if in_rootfs {
            if let Some(staging) = self.staging.as_mut() {
                if staging.applied + 1 == count {
                    staging.applied = count;
                }
            }
        }
        Ok((StepStatus::Built, Some(key)))
    }

    /// Base layers plus built layers.
    fn layer_count(&self) -> usize {
        self.base.as_ref().map(|b| b.layers.len()).unwrap_or(0) + self.chain.len()
    }

    fn layer_path(&self, index: usize) -> Option<&Path> {
        let base_layers = self.base.as_ref().map(|b| b.layers.as_slice()).unwrap_or(&[]);
        match base_layers.get(index) {
            Some(layer) => Some(&layer.path),
            None => self
                .chain
                .get(index - base_layers.len())
                .map(|c| c.blob.as_path()),
        }
    }

    /// The staging rootfs with every layer so far applied.
    fn rootfs(&mut self) -> Result<PathBuf> {
        if self.staging.is_none() {
            self.staging = Some(Staging {
                dir: self.engine.cache.staging_dir("rootfs-")?,
                applied: 0,
            });
        }

        let total = self.layer_count();
        let (root, start) = match &self.staging {
            Some(staging) => (staging.dir.path().to_path_buf(), staging.applied),
            None => return Err(StrataError::Other("staging rootfs missing".to_string())),
        };

        for index in start..total {
            let path = self.layer_path(index).ok_or_else(|| {
                StrataError::LayerError(format!("layer {} missing from chain", index))
            })?;
            extract_layer(path, &root)?;
        }
        if start < total {
            tracing::debug!(
                rootfs = %root.display(),
                layers = total - start,
                "Staging rootfs updated"
            );
        }
        if let Some(staging) = self.staging.as_mut() {
            staging.applied = total;
        }
        Ok(root)
    }
}

fn layer_payload(key: &CacheKey, step: &Step) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("key".to_string(), serde_json::json!(key.as_str())),
        ("line".to_string(), serde_json::json!(step.line)),
        ("stage".to_string(), serde_json::json!(step.stage())),
    ])
}

fn step_event(key: &str, step: &Step, status: Option<StepStatus>) -> BuildEvent {
    let mut payload = HashMap::from([
        ("line".to_string(), serde_json::json!(step.line)),
        ("stage".to_string(), serde_json::json!(step.stage())),
        ("instruction".to_string(), serde_json::json!(step.instruction)),
    ]);
    if let Some(status) = status {
        let status = match status {
            StepStatus::Resolved => "resolved",
            StepStatus::Cached => "cached",
            StepStatus::Built => "built",
            StepStatus::Applied => "applied",
        };
        payload.insert("status".to_string(), serde_json::json!(status));
    }
    BuildEvent::with_map(key, payload)
}
