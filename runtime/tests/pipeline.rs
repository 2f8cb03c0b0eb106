//! Integration test: build images end to end against a local base image.
//!
//! A base image is written as an OCI layout and imported into a fresh
//! store, so resolution never touches a registry. Install and RUN commands
//! go through a fake executor that records every invocation and writes
//! marker files for the packages it "installs".

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use strata_core::error::{Result, StartError, StrataError};
use strata_core::event::events;
use strata_core::{BuildPhase, BuildStage, EventEmitter};
use strata_runtime::build::layer::pack_dir;
use strata_runtime::build::{
    BuildEngine, BuildOutcome, BuildRequest, Command, CommandExecutor, ExecOutput, ExecRequest,
    LintCode, Manifest, StepStatus,
};
use strata_runtime::cache::LayerCache;
use strata_runtime::oci::layout::{write_layout, LayoutLayer};
use strata_runtime::{ImageReference, ImageStore, LocalRuntime, StoreResolver};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const APP_BUILD_FILE: &str = r#"
FROM runtime:X
WORKDIR /app
COPY requirements.txt .
RUN pip install -r requirements.txt
COPY . .
EXPOSE 8000
ENTRYPOINT ["run", "app.py"]
"#;

/// Pretends to be a package installer.
///
/// `pip install -r <file>` writes one marker per requirement under
/// `/usr/lib/site-packages`; a requirement named `missing-pkg` fails the
/// install. Any other command touches `/var/run-marker`.
#[derive(Default)]
struct FakeExecutor {
    installs: AtomicUsize,
    runs: AtomicUsize,
}

impl FakeExecutor {
    fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let workdir = request.rootfs.join(request.context.workdir.relative());
        let script = match &request.command {
            Command::Shell(s) => s.clone(),
            Command::Exec(argv) => argv.join(" "),
        };

        if let Some(file) = script.strip_prefix("pip install -r ") {
            self.installs.fetch_add(1, Ordering::SeqCst);
            let manifest = Manifest::from_file(&workdir.join(file.trim()))?;
            if let Some(req) = manifest.requirements.iter().find(|r| r.name == "missing-pkg") {
                return Ok(ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("ERROR: No matching distribution found for {}\n", req),
                });
            }
            let site = request.rootfs.join("usr/lib/site-packages");
            std::fs::create_dir_all(&site)?;
            for req in &manifest.requirements {
                std::fs::write(site.join(&req.name), req.to_string())?;
            }
            return Ok(ExecOutput::default());
        }

        self.runs.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(request.rootfs.join("var"))?;
        std::fs::write(request.rootfs.join("var/run-marker"), &script)?;
        Ok(ExecOutput::default())
    }
}

struct Harness {
    _home: TempDir,
    context: TempDir,
    store: Arc<ImageStore>,
    executor: Arc<FakeExecutor>,
    engine: BuildEngine,
    home_path: std::path::PathBuf,
}

impl Harness {
    async fn new() -> Self {
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(&home.path().join("images"), u64::MAX).unwrap());
        let cache = Arc::new(LayerCache::new(&home.path().join("cache")).unwrap());

        let resolver = StoreResolver::offline(store.clone());
        let layout = home.path().join("base-layout");
        write_base_layout(&layout, home.path());
        resolver
            .import(&layout, &ImageReference::parse("runtime:X").unwrap())
            .await
            .unwrap();

        let executor = Arc::new(FakeExecutor::default());
        let engine = BuildEngine::new(
            Arc::new(resolver),
            executor.clone(),
            cache,
            store.clone(),
        );

        let context = TempDir::new().unwrap();
        write(context.path(), "requirements.txt", "pkgA==1.0\n");
        write(context.path(), "app.py", "print('serving on 8000')\n");
        write(context.path(), "Stratafile", APP_BUILD_FILE);

        let home_path = home.path().to_path_buf();
        Self {
            _home: home,
            context,
            store,
            executor,
            engine,
            home_path,
        }
    }

    async fn build(&self) -> Result<BuildOutcome> {
        self.engine
            .build(
                BuildRequest::new(self.context.path(), "app:latest"),
                CancellationToken::new(),
            )
            .await
    }

    fn write(&self, name: &str, content: &str) {
        write(self.context.path(), name, content);
    }
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Base image: a `run` launcher on PATH and an os-release file.
fn write_base_layout(layout: &Path, scratch: &Path) {
    let tree = scratch.join("base-tree");
    std::fs::create_dir_all(tree.join("usr/bin")).unwrap();
    std::fs::create_dir_all(tree.join("etc")).unwrap();
    std::fs::write(tree.join("usr/bin/run"), "launcher").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            tree.join("usr/bin/run"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }
    std::fs::write(tree.join("etc/os-release"), "ID=runtime\nVERSION_ID=X\n").unwrap();

    let blob = scratch.join("base-layer.tar.gz");
    let archive = pack_dir(&tree, &blob).unwrap();
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/local/bin:/usr/bin:/bin"],
            "Cmd": ["/bin/sh"]
        },
        "rootfs": { "type": "layers", "diff_ids": [format!("sha256:{}", archive.diff_id)] },
        "history": [{ "created_by": "base tree" }]
    });
    write_layout(
        layout,
        &[LayoutLayer {
            source: blob,
            digest: format!("sha256:{}", archive.digest),
            size: archive.size,
        }],
        &config,
        Some("runtime:X"),
    )
    .unwrap();
}

fn statuses(outcome: &BuildOutcome) -> Vec<(BuildStage, StepStatus)> {
    outcome.steps.iter().map(|s| (s.stage, s.status)).collect()
}

#[tokio::test]
async fn test_end_to_end_build_and_rebuild() {
    let h = Harness::new().await;

    let first = h.build().await.unwrap();
    assert_eq!(h.executor.installs(), 1);
    assert_eq!(first.image.reference, "docker.io/library/app:latest");
    assert_eq!(first.image.base, "docker.io/library/runtime:X");
    assert_eq!(first.image.entrypoint, vec!["run", "app.py"]);
    assert_eq!(first.image.exposed_ports, vec!["8000/tcp"]);
    assert_eq!(first.image.workdir, "/app");
    assert_eq!(first.image.layers.len(), 2);
    assert_eq!(
        first.transitions,
        vec![
            BuildPhase::Init,
            BuildPhase::BaseResolved,
            BuildPhase::DependenciesBuilt,
            BuildPhase::SourceOverlaid,
            BuildPhase::ContractDeclared,
            BuildPhase::EntrypointSet,
            BuildPhase::Built,
        ]
    );
    assert_eq!(first.layers_built(), 2);

    let second = h.build().await.unwrap();
    assert_eq!(h.executor.installs(), 1);
    assert_eq!(second.layers_built(), 0);
    assert_eq!(second.cache_hits(), 2);
    let keys = |o: &BuildOutcome| o.image.layers.iter().map(|l| l.key.clone()).collect::<Vec<_>>();
    assert_eq!(keys(&first), keys(&second));

    let stored = h.store.get("docker.io/library/app:latest").await.unwrap();
    assert_eq!(stored.digest, second.image.id);

    let runtime = LocalRuntime::new(h.store.clone(), &h.home_path.join("containers"));
    let launch = runtime.prepare("app:latest").await.unwrap();
    assert_eq!(launch.program, "/usr/bin/run");
    assert_eq!(launch.argv, vec!["run", "app.py"]);
    assert!(launch.rootfs().join("app/app.py").is_file());
    assert!(launch.rootfs().join("app/requirements.txt").is_file());
    assert!(launch.rootfs().join("usr/lib/site-packages/pkgA").is_file());
    assert!(launch.rootfs().join("etc/os-release").is_file());
}

#[tokio::test]
async fn test_source_edit_reuses_dependency_layer() {
    let h = Harness::new().await;
    let first = h.build().await.unwrap();

    h.write("app.py", "print('serving on 8000, v2')\n");
    let second = h.build().await.unwrap();

    assert_eq!(h.executor.installs(), 1);
    assert_eq!(
        statuses(&second),
        vec![
            (BuildStage::Base, StepStatus::Resolved),
            (BuildStage::Workdir, StepStatus::Applied),
            (BuildStage::Dependencies, StepStatus::Cached),
            (BuildStage::SourceOverlay, StepStatus::Built),
            (BuildStage::Contract, StepStatus::Applied),
            (BuildStage::Entrypoint, StepStatus::Applied),
        ]
    );
    assert_eq!(first.image.layers[0].key, second.image.layers[0].key);
    assert_ne!(first.image.layers[1].key, second.image.layers[1].key);
    assert_ne!(first.image.id, second.image.id);
}

#[tokio::test]
async fn test_manifest_edit_rebuilds_dependencies() {
    let h = Harness::new().await;
    h.build().await.unwrap();

    h.write("requirements.txt", "pkgA==2.0\n");
    let second = h.build().await.unwrap();
    assert_eq!(h.executor.installs(), 2);
    assert_eq!(second.layers_built(), 2);
}

#[tokio::test]
async fn test_ignored_files_do_not_invalidate_overlay() {
    let h = Harness::new().await;
    std::fs::create_dir_all(h.context.path().join(".git")).unwrap();
    h.write(".git/HEAD", "ref: refs/heads/main\n");
    h.build().await.unwrap();

    h.write(".git/HEAD", "ref: refs/heads/other\n");
    let second = h.build().await.unwrap();
    assert_eq!(second.layers_built(), 0);
}

#[tokio::test]
async fn test_source_before_install_reruns_install_on_every_edit() {
    let h = Harness::new().await;
    h.write(
        "Stratafile",
        r#"
FROM runtime:X
WORKDIR /app
COPY . .
RUN pip install -r requirements.txt
ENTRYPOINT ["run", "app.py"]
"#,
    );

    let first = h.build().await.unwrap();
    assert!(first
        .warnings
        .iter()
        .any(|w| w.code == LintCode::SourceBeforeInstall && w.line == 5));

    h.write("app.py", "print('edited')\n");
    h.build().await.unwrap();
    assert_eq!(h.executor.installs(), 2);
}

#[tokio::test]
async fn test_last_entrypoint_wins() {
    let h = Harness::new().await;
    h.write(
        "Stratafile",
        r#"
FROM runtime:X
WORKDIR /app
COPY . .
CMD ["python", "old.py"]
ENTRYPOINT ["run", "app.py"]
"#,
    );

    let outcome = h.build().await.unwrap();
    assert_eq!(outcome.image.entrypoint, vec!["run", "app.py"]);
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.code == LintCode::EntrypointOverridden && w.line == 5));
}

#[tokio::test]
async fn test_base_command_is_inherited_without_entrypoint() {
    let h = Harness::new().await;
    h.write("Stratafile", "FROM runtime:X\nCOPY app.py /srv/\n");

    let outcome = h.build().await.unwrap();
    assert_eq!(outcome.image.entrypoint, vec!["/bin/sh"]);
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.code == LintCode::NoEntrypoint));
}

#[tokio::test]
async fn test_run_step_layer_and_env() {
    let h = Harness::new().await;
    h.write(
        "Stratafile",
        r#"
FROM runtime:X
ENV APP_MODE=production
RUN touch /var/run-marker
ENTRYPOINT ["run"]
"#,
    );

    let outcome = h.build().await.unwrap();
    assert_eq!(h.executor.runs.load(Ordering::SeqCst), 1);
    assert!(outcome.image.env.contains(&"APP_MODE=production".to_string()));
    assert_eq!(outcome.image.layers.len(), 1);
    assert_eq!(outcome.image.layers[0].kind, BuildStage::Run);

    h.build().await.unwrap();
    assert_eq!(h.executor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_cache_reexecutes_and_republishes() {
    let h = Harness::new().await;
    let first = h.build().await.unwrap();

    let mut request = BuildRequest::new(h.context.path(), "app:latest");
    request.no_cache = true;
    let second = h
        .engine
        .build(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.executor.installs(), 2);
    assert_eq!(second.layers_built(), 2);
    assert_eq!(
        first.image.layers[0].key, second.image.layers[0].key,
        "keys do not depend on cache use"
    );
}

#[tokio::test]
async fn test_install_failure_leaves_no_image() {
    let h = Harness::new().await;
    h.write("requirements.txt", "pkgA==1.0\nmissing-pkg==9.9\n");
    let mut failed = h
        .engine
        .events()
        .subscribe_filtered(|e| e.key == events::BUILD_FAILED);

    let err = h.build().await.unwrap_err();
    assert_eq!(err.stage(), Some(BuildStage::Dependencies));
    match err.root_cause() {
        StrataError::DependencyInstall { package, .. } => {
            assert_eq!(package.as_deref(), Some("missing-pkg"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("line 4"));

    assert!(h.store.get("docker.io/library/app:latest").await.is_none());
    assert_eq!(failed.drain().len(), 1);
}

#[tokio::test]
async fn test_invalid_port_fails_before_any_step() {
    let h = Harness::new().await;
    h.write(
        "Stratafile",
        "FROM runtime:X\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nEXPOSE 70000\n",
    );

    let err = h.build().await.unwrap_err();
    assert!(matches!(err.root_cause(), StrataError::InvalidPort(_)));
    assert_eq!(err.stage(), Some(BuildStage::Contract));
    assert_eq!(h.executor.installs(), 0);
}

#[tokio::test]
async fn test_unknown_base_is_resolution_error() {
    let h = Harness::new().await;
    h.write("Stratafile", "FROM nosuch:1\nENTRYPOINT [\"run\"]\n");

    let err = h.build().await.unwrap_err();
    assert_eq!(err.stage(), Some(BuildStage::Base));
    assert!(matches!(err.root_cause(), StrataError::Resolution { .. }));
}

#[tokio::test]
async fn test_cancellation_stops_at_stage_boundary() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .engine
        .build(BuildRequest::new(h.context.path(), "app:latest"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StrataError::Cancelled {
            stage: BuildStage::Base
        }
    ));
    assert!(h.store.get("docker.io/library/app:latest").await.is_none());
}

#[tokio::test]
async fn test_missing_entrypoint_program_fails_only_at_start() {
    let h = Harness::new().await;
    h.write(
        "Stratafile",
        "FROM runtime:X\nWORKDIR /app\nCOPY . .\nENTRYPOINT [\"gunicorn\", \"app:app\"]\n",
    );

    let outcome = h.build().await.unwrap();
    assert_eq!(outcome.image.entrypoint, vec!["gunicorn", "app:app"]);

    let runtime = LocalRuntime::new(h.store.clone(), &h.home_path.join("containers"));
    let err = runtime.prepare("app:latest").await.unwrap_err();
    assert!(matches!(
        err,
        StartError::EntrypointNotFound { ref program, .. } if program == "gunicorn"
    ));
}

#[tokio::test]
async fn test_events_report_cache_hits() {
    let h = Harness::new().await;
    h.build().await.unwrap();

    let emitter: &EventEmitter = h.engine.events();
    let mut hits = emitter.subscribe_filtered(|e| e.key == events::LAYER_CACHE_HIT);
    h.build().await.unwrap();
    assert_eq!(hits.drain().len(), 2);
}
