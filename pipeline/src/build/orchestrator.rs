//! Build orchestration: validate inputs, run a backend, store the image.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use dockyard_core::config::{AppRuntime, BuildBackendKind, PipelineConfig};
use dockyard_core::error::{PipelineError, Result};
use dockyard_core::event::{events, EventEmitter, PipelineEvent};

use super::{source_date_epoch, BuildBackend, BuildJob, DockerBackend, NativeBackend};
use crate::oci::{ImageReference, ImageStore};

/// Everything needed to build one application image.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub app: String,
    /// Build context directory
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    /// Local reference the image is stored under
    pub target: ImageReference,
    pub build_args: BTreeMap<String, String>,
    /// Declared runtime; `None` means detect
    pub runtime: Option<AppRuntime>,
    pub backend: BuildBackendKind,
}

impl BuildSpec {
    /// Build spec for a configured application.
    pub fn from_config(config: &PipelineConfig, app: &str) -> Result<Self> {
        let app_config = config.app(app)?;
        let repository = app_config.image.clone().unwrap_or_else(|| app.to_string());
        let target = ImageReference::new("", repository, app_config.tag.clone())
            .map_err(|e| PipelineError::ConfigError(format!("apps.{}: {}", app, e)))?;

        Ok(Self {
            app: app.to_string(),
            context: config.context_dir(app_config),
            dockerfile: config.dockerfile_path(app_config),
            target,
            build_args: app_config.build_args.clone(),
            runtime: app_config.runtime,
            backend: app_config.backend,
        })
    }

    /// Check the inputs exist before any backend runs.
    fn validate(&self) -> Result<AppRuntime> {
        if !self.context.is_dir() {
            return Err(PipelineError::build(format!(
                "build context {} does not exist",
                self.context.display()
            )));
        }
        if !self.dockerfile.is_file() {
            return Err(PipelineError::build(format!(
                "Dockerfile {} not found",
                self.dockerfile.display()
            )));
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => AppRuntime::detect(&self.context),
        };
        let manifests = runtime.manifests();
        if !manifests.is_empty() && !manifests.iter().any(|m| self.context.join(m).is_file()) {
            return Err(PipelineError::build(format!(
                "missing dependency manifest for {} application (expected {})",
                runtime,
                manifests.join(" or ")
            )));
        }
        Ok(runtime)
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Local reference the image is stored under
    pub reference: ImageReference,
    /// Manifest digest
    pub digest: String,
    /// Total image size in bytes
    pub size: u64,
    pub layer_count: usize,
}

/// Runs builds and stores their output.
///
/// Builds of one application are serialized; different applications build
/// concurrently.
pub struct BuildOrchestrator {
    store: Arc<ImageStore>,
    native: NativeBackend,
    docker: DockerBackend,
    app_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventEmitter,
}

impl BuildOrchestrator {
    pub fn new(store: Arc<ImageStore>, events: EventEmitter) -> Self {
        Self {
            native: NativeBackend::new(store.clone()),
            docker: DockerBackend::default(),
            store,
            app_locks: parking_lot::Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Replace the docker backend (e.g. a different CLI binary).
    pub fn with_docker(mut self, docker: DockerBackend) -> Self {
        self.docker = docker;
        self
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    /// Build the image described by `spec` and store it under `spec.target`.
    pub async fn build(&self, spec: BuildSpec) -> Result<BuiltImage> {
        let app = spec.app.clone();
        self.build_inner(spec).await.map_err(|e| e.with_app(&app))
    }

    async fn build_inner(&self, spec: BuildSpec) -> Result<BuiltImage> {
        let lock = self.app_lock(&spec.app);
        let _guard = lock.lock().await;

        let runtime = spec.validate()?;
        let epoch = source_date_epoch(&spec.build_args)?;
        let backend: &dyn BuildBackend = match spec.backend {
            BuildBackendKind::Native => &self.native,
            BuildBackendKind::Docker => &self.docker,
        };

        tracing::info!(
            app = %spec.app,
            target = %spec.target,
            runtime = %runtime,
            backend = backend.name(),
            "Building image"
        );
        self.events.emit(PipelineEvent::with_fields(
            events::BUILD_STARTED,
            [
                ("app", serde_json::json!(spec.app)),
                ("target", serde_json::json!(spec.target.to_string())),
                ("backend", serde_json::json!(backend.name())),
            ],
        ));

        let workspace = tempfile::Builder::new()
            .prefix("dockyard-build-")
            .tempdir()?;
        let output_dir = workspace.path().join("image");

        let job = BuildJob {
            app: &spec.app,
            context_dir: &spec.context,
            dockerfile: &spec.dockerfile,
            target: &spec.target,
            build_args: &spec.build_args,
            source_date_epoch: epoch,
            events: &self.events,
        };
        backend.build(&job, &output_dir).await?;

        let stored = self.store.put(&spec.target, &output_dir).await?;
        let layer_count = stored.layout()?.manifest().layers.len();

        let built = BuiltImage {
            reference: spec.target,
            digest: stored.digest,
            size: stored.size_bytes,
            layer_count,
        };

        tracing::info!(
            app = %spec.app,
            reference = %built.reference,
            digest = %built.digest,
            layers = built.layer_count,
            "Image built"
        );
        self.events.emit(PipelineEvent::with_fields(
            events::BUILD_COMPLETED,
            [
                ("app", serde_json::json!(spec.app)),
                ("reference", serde_json::json!(built.reference.to_string())),
                ("digest", serde_json::json!(built.digest)),
            ],
        ));

        Ok(built)
    }

    fn app_lock(&self, app: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.app_locks
            .lock()
            .entry(app.to_string())
            .or_default()
            .clone()
    }
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("store", &self.store)
            .finish()
    }
}
